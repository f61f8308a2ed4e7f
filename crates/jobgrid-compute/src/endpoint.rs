//! Network-facing side of a compute node.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use jobgrid_core::protocol::{
    AskForBidRequest, AskForBidResponse, Callback, ComputeEndpoint, ComputeFailure,
    ExecutionMetadata, ExecutionRequest, ExecutionResponse,
};
use jobgrid_core::{
    BackgroundTasks, ComputeNodeInfo, CoreError, CoreResult, Execution, ExecutionDesiredState,
    ExecutionStateType, NodeInfo, Resources,
};
use jobgrid_state::{ExecutionStore, StateError, UpdateExecutionRequest};

use crate::bidder::{BidRequest, Bidder};
use crate::buffer::ExecutorBuffer;
use crate::capacity::ResourceCapacityTracker;
use crate::executor::Executor;

pub struct ComputeNodeParams {
    pub node_id: String,
    /// Advertised to discovery and matched against job constraints.
    pub labels: HashMap<String, String>,
    pub version: Option<semver::Version>,
    /// Names of the installed engines, publishers and storage sources.
    pub engines: Vec<String>,
    pub publishers: Vec<String>,
    pub storage_sources: Vec<String>,
    /// Largest single job this node accepts.
    pub job_resource_limits: Resources,
    /// The node-local store for executions this node has bid on.
    pub store: Arc<dyn ExecutionStore>,
    pub callback: Arc<dyn Callback>,
    pub bidder: Bidder,
    pub buffer: ExecutorBuffer,
    /// Publishes accepted results. Runs go through the buffer instead.
    pub executor: Arc<dyn Executor>,
    /// Shared with the buffer; read for the advertised capacity.
    pub running_capacity: Arc<ResourceCapacityTracker>,
    pub tasks: BackgroundTasks,
}

/// A compute node reachable through [`ComputeEndpoint`].
pub struct ComputeNode {
    params: ComputeNodeParams,
}

impl ComputeNode {
    /// Create a new compute node.
    pub fn new(params: ComputeNodeParams) -> Self {
        Self { params }
    }

    pub fn node_id(&self) -> &str {
        &self.params.node_id
    }

    /// The buffer queueing and running this node's executions.
    pub fn buffer(&self) -> &ExecutorBuffer {
        &self.params.buffer
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.params.store
    }

    /// What this node advertises to discovery right now.
    pub fn node_info(&self) -> NodeInfo {
        let p = &self.params;
        let info = ComputeNodeInfo {
            engines: p.engines.clone(),
            publishers: p.publishers.clone(),
            storage_sources: p.storage_sources.clone(),
            max_capacity: p.running_capacity.get_max_capacity(),
            available_capacity: p.running_capacity.get_available_capacity(),
            max_job_requirements: p.job_resource_limits.clone(),
            running_executions: p.buffer.running_executions().len() as u32,
            enqueued_executions: p.buffer.enqueued_executions_count() as u32,
        };
        let node = NodeInfo::compute(&p.node_id, info).with_labels(p.labels.clone());
        match &p.version {
            Some(version) => node.with_version(version.clone()),
            None => node,
        }
    }

    fn remote(&self, err: impl std::fmt::Display) -> CoreError {
        CoreError::Remote {
            node_id: self.params.node_id.clone(),
            message: err.to_string(),
        }
    }

    fn response(execution: &Execution) -> ExecutionResponse {
        ExecutionResponse {
            execution_metadata: ExecutionMetadata::of(execution),
        }
    }

    /// Transition a local execution; errors become remote errors for the
    /// caller.
    fn transition(
        &self,
        request: &ExecutionRequest,
        expected: &[ExecutionStateType],
        next: ExecutionStateType,
        desired: Option<ExecutionDesiredState>,
    ) -> CoreResult<Execution> {
        let mut update = UpdateExecutionRequest::new(&request.execution_id)
            .expect_states(expected)
            .compute_state(next, request.justification.clone());
        if let Some(desired) = desired {
            update = update.desired_state(desired, request.justification.clone());
        }
        self.params
            .store
            .update_execution_state(update)
            .map_err(|e| self.remote(e))
    }
}

#[async_trait]
impl ComputeEndpoint for ComputeNode {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> CoreResult<AskForBidResponse> {
        let execution = request.execution;
        debug!(
            execution_id = %execution.id,
            job_id = %execution.job_id,
            from = %request.routing.source_peer_id,
            "ask for bid received"
        );
        match self.params.store.create_execution(&execution) {
            Ok(()) => {}
            Err(StateError::AlreadyExists(_)) => {
                debug!(execution_id = %execution.id, "duplicate ask for bid");
            }
            Err(e) => return Err(self.remote(e)),
        }

        let execution_metadata = ExecutionMetadata::of(&execution);
        self.params.bidder.run_bidding(BidRequest {
            routing: request.routing,
            execution,
            wait_for_approval: request.wait_for_approval,
        });
        Ok(AskForBidResponse { execution_metadata })
    }

    async fn bid_accepted(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        let execution = self.transition(
            &request,
            &[ExecutionStateType::AskForBidAccepted],
            ExecutionStateType::BidAccepted,
            Some(ExecutionDesiredState::Running),
        )?;
        info!(execution_id = %execution.id, node_id = %self.params.node_id, "bid accepted by orchestrator");

        if let Err(e) = self.params.buffer.run(execution.clone()) {
            warn!(execution_id = %execution.id, error = %e, "execution not admitted");
            let message = e.to_string();
            let failed = self.params.store.update_execution_state(
                UpdateExecutionRequest::new(&execution.id)
                    .expect_states(&[ExecutionStateType::BidAccepted])
                    .compute_state(ExecutionStateType::Failed, message.clone())
                    .desired_state(ExecutionDesiredState::Stopped, message.clone()),
            );
            if failed.is_ok() {
                self.params
                    .callback
                    .on_compute_failure(ComputeFailure {
                        routing: request.routing.reply(),
                        execution_metadata: ExecutionMetadata::of(&execution),
                        message,
                    })
                    .await;
            }
        }
        Ok(Self::response(&execution))
    }

    async fn bid_rejected(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        let execution = self.transition(
            &request,
            &[ExecutionStateType::AskForBidAccepted],
            ExecutionStateType::BidRejected,
            Some(ExecutionDesiredState::Stopped),
        )?;
        debug!(execution_id = %execution.id, "bid rejected by orchestrator");
        Ok(Self::response(&execution))
    }

    async fn result_accepted(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        let execution = self.transition(
            &request,
            &[ExecutionStateType::ResultProposed],
            ExecutionStateType::ResultAccepted,
            None,
        )?;
        let executor = self.params.executor.clone();
        let execution_id = execution.id.clone();
        self.params.tasks.spawn(async move {
            if let Err(e) = executor.publish(&execution_id).await {
                warn!(%execution_id, error = %e, "publish failed");
            }
        });
        Ok(Self::response(&execution))
    }

    async fn result_rejected(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        let execution = self.transition(
            &request,
            &[ExecutionStateType::ResultProposed],
            ExecutionStateType::ResultRejected,
            Some(ExecutionDesiredState::Stopped),
        )?;
        debug!(execution_id = %execution.id, "result rejected by orchestrator");
        Ok(Self::response(&execution))
    }

    async fn cancel_execution(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
        let execution = self
            .params
            .store
            .get_execution(&request.execution_id)
            .map_err(|e| self.remote(e))?;
        info!(execution_id = %execution.id, reason = %request.justification, "cancelling execution");
        self.params.buffer.cancel(&execution);
        Ok(Self::response(&execution))
    }
}
