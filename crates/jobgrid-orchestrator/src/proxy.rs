//! Routes compute requests to the endpoint of their target node.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use jobgrid_core::protocol::{
    AskForBidRequest, AskForBidResponse, ComputeEndpoint, ExecutionRequest, ExecutionResponse,
};
use jobgrid_core::{CoreError, CoreResult};

/// Fans out [`ComputeEndpoint`] calls by `routing.target_peer_id`.
#[derive(Default)]
pub struct ComputeProxy {
    endpoints: RwLock<HashMap<String, Arc<dyn ComputeEndpoint>>>,
}

impl ComputeProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: &str, endpoint: Arc<dyn ComputeEndpoint>) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        endpoints.insert(node_id.to_string(), endpoint);
    }

    pub fn unregister(&self, node_id: &str) -> bool {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        endpoints.remove(node_id).is_some()
    }

    fn endpoint(&self, node_id: &str) -> CoreResult<Arc<dyn ComputeEndpoint>> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        endpoints
            .get(node_id)
            .cloned()
            .ok_or_else(|| CoreError::NodeUnreachable(node_id.to_string()))
    }
}

#[async_trait]
impl ComputeEndpoint for ComputeProxy {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> CoreResult<AskForBidResponse> {
        self.endpoint(&request.routing.target_peer_id)?
            .ask_for_bid(request)
            .await
    }

    async fn bid_accepted(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        self.endpoint(&request.routing.target_peer_id)?
            .bid_accepted(request)
            .await
    }

    async fn bid_rejected(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        self.endpoint(&request.routing.target_peer_id)?
            .bid_rejected(request)
            .await
    }

    async fn result_accepted(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        self.endpoint(&request.routing.target_peer_id)?
            .result_accepted(request)
            .await
    }

    async fn result_rejected(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        self.endpoint(&request.routing.target_peer_id)?
            .result_rejected(request)
            .await
    }

    async fn cancel_execution(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        self.endpoint(&request.routing.target_peer_id)?
            .cancel_execution(request)
            .await
    }
}
