//! Compute protocol contracts.
//!
//! The orchestrator talks to compute nodes through [`ComputeEndpoint`];
//! compute nodes report back through [`Callback`]. Both are transport
//! agnostic: any request/response or stream transport that satisfies the
//! method contracts will do, including direct in-process calls.
//!
//! ```text
//! Orchestrator                          Compute node
//!   ask_for_bid ───────────────────────▶  bidder
//!              ◀─────────────────────── on_bid_complete
//!   bid_accepted ──────────────────────▶  executor buffer
//!              ◀─────────────────────── on_run_complete
//!   result_accepted ───────────────────▶  publisher
//!              ◀─────────────────────── on_publish_complete
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::execution::{Execution, ExecutionId, PublishedResult, RunCommandResult};
use crate::job::JobId;

/// Who sent a message and who it is for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub source_peer_id: String,
    pub target_peer_id: String,
}

impl RoutingMetadata {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source_peer_id: source.to_string(),
            target_peer_id: target.to_string(),
        }
    }

    /// The same route in the opposite direction.
    pub fn reply(&self) -> Self {
        Self {
            source_peer_id: self.target_peer_id.clone(),
            target_peer_id: self.source_peer_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
}

impl ExecutionMetadata {
    pub fn of(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            job_id: execution.job_id.clone(),
        }
    }
}

// ── Orchestrator → compute ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForBidRequest {
    pub routing: RoutingMetadata,
    pub execution: Execution,
    /// When false, an accepted bid starts running without waiting for
    /// `bid_accepted`.
    pub wait_for_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForBidResponse {
    pub execution_metadata: ExecutionMetadata,
}

/// Request shared by every execution-keyed follow-up message
/// (bid accepted/rejected, result accepted/rejected, cancel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub routing: RoutingMetadata,
    pub execution_id: ExecutionId,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub execution_metadata: ExecutionMetadata,
}

#[async_trait]
pub trait ComputeEndpoint: Send + Sync {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> CoreResult<AskForBidResponse>;
    async fn bid_accepted(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse>;
    async fn bid_rejected(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse>;
    async fn result_accepted(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse>;
    async fn result_rejected(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse>;
    async fn cancel_execution(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse>;
}

// ── Compute → orchestrator ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidResult {
    pub routing: RoutingMetadata,
    pub execution_metadata: ExecutionMetadata,
    pub accepted: bool,
    pub reason: String,
    /// The node accepted without waiting for approval and has already
    /// handed the execution to its buffer; no `bid_accepted` follows.
    #[serde(default)]
    pub direct_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub routing: RoutingMetadata,
    pub execution_metadata: ExecutionMetadata,
    pub output: RunCommandResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResult {
    pub routing: RoutingMetadata,
    pub execution_metadata: ExecutionMetadata,
    pub published: PublishedResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResult {
    pub routing: RoutingMetadata,
    pub execution_metadata: ExecutionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeFailure {
    pub routing: RoutingMetadata,
    pub execution_metadata: ExecutionMetadata,
    pub message: String,
}

/// Asynchronous notifications from a compute node. Implementations handle
/// their own errors; a notification is never retried by the sender.
#[async_trait]
pub trait Callback: Send + Sync {
    async fn on_bid_complete(&self, result: BidResult);
    async fn on_run_complete(&self, result: RunResult);
    async fn on_publish_complete(&self, result: PublishResult);
    async fn on_cancel_complete(&self, result: CancelResult);
    async fn on_compute_failure(&self, failure: ComputeFailure);
}
