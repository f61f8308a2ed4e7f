//! Bidder: decides whether this node bids on an execution.
//!
//! | semantic | resource (only asked if semantic bids) | result   |
//! |----------|----------------------------------------|----------|
//! | bid      | bid                                    | accepted |
//! | bid      | reject                                 | rejected |
//! | reject   | not evaluated                          | rejected |
//!
//! A strategy or calculator error aborts the attempt and fails the
//! execution. Every outcome is written with a conditional update that
//! expects the execution to still be `New`, so a stale or duplicate
//! bidding request changes nothing and reports nothing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use jobgrid_core::metrics::BIDS_TOTAL;
use jobgrid_core::protocol::{
    BidResult, Callback, ComputeFailure, ExecutionMetadata, RoutingMetadata,
};
use jobgrid_core::{
    BackgroundTasks, Execution, ExecutionDesiredState, ExecutionStateType, Job, Resources,
    SharedMetrics,
};
use jobgrid_state::{ExecutionStore, UpdateExecutionRequest};

use crate::bidstrategy::{ResourceBidStrategy, SemanticBidStrategy};
use crate::buffer::ExecutorBuffer;
use crate::capacity::UsageCalculator;
use crate::error::ComputeResult;

/// An ask-for-bid as seen by the bidder.
#[derive(Debug, Clone)]
pub struct BidRequest {
    pub routing: RoutingMetadata,
    pub execution: Execution,
    /// When false an accepted bid goes straight to the buffer.
    pub wait_for_approval: bool,
}

pub struct BidderParams {
    pub node_id: String,
    /// Judges whether the job is something this node can run at all.
    pub semantic_strategy: Arc<dyn SemanticBidStrategy>,
    /// Judges whether the job's usage fits the node's capacity.
    pub resource_strategy: Arc<dyn ResourceBidStrategy>,
    /// Resolves the resources an execution will hold while it runs.
    pub usage_calculator: Arc<dyn UsageCalculator>,
    /// The node-local store the bid outcome is recorded in.
    pub store: Arc<dyn ExecutionStore>,
    /// Where bid results are reported.
    pub callback: Arc<dyn Callback>,
    /// Receives executions accepted without waiting for approval.
    pub buffer: ExecutorBuffer,
    pub tasks: BackgroundTasks,
    pub metrics: SharedMetrics,
}

enum BidDecision {
    Accept { usage: Resources, reason: String },
    Reject { reason: String },
}

/// Answers ask-for-bid requests for one compute node.
#[derive(Clone)]
pub struct Bidder {
    inner: Arc<BidderParams>,
}

impl Bidder {
    /// Create a new bidder.
    pub fn new(params: BidderParams) -> Self {
        Self {
            inner: Arc::new(params),
        }
    }

    /// Evaluate the bid on a background task.
    pub fn run_bidding(&self, request: BidRequest) {
        let bidder = self.clone();
        self.inner
            .tasks
            .spawn(async move { bidder.do_bidding(request).await });
    }

    async fn evaluate(&self, job: &Job) -> ComputeResult<BidDecision> {
        let semantic = self.inner.semantic_strategy.should_bid(job).await?;
        if !semantic.should_bid {
            return Ok(BidDecision::Reject {
                reason: semantic.reason,
            });
        }

        let parsed = job.task.resources.to_resources()?;
        let usage = self.inner.usage_calculator.calculate(job, &parsed).await?;
        let resource = self
            .inner
            .resource_strategy
            .should_bid_based_on_usage(job, &usage)
            .await?;
        if !resource.should_bid {
            return Ok(BidDecision::Reject {
                reason: resource.reason,
            });
        }

        Ok(BidDecision::Accept {
            usage,
            reason: resource.reason,
        })
    }

    async fn do_bidding(&self, request: BidRequest) {
        let BidRequest {
            routing,
            execution,
            wait_for_approval,
        } = request;
        let reply = routing.reply();
        let inner = &self.inner;

        let decision = match self.evaluate(&execution.job).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(execution_id = %execution.id, error = %e, "bidding failed");
                inner.metrics.increment_counter(BIDS_TOTAL, &[("decision", "failed")]);
                self.fail(&execution, ExecutionStateType::New, e.to_string(), reply)
                    .await;
                return;
            }
        };

        match decision {
            BidDecision::Accept { usage, reason } => {
                let update = UpdateExecutionRequest::new(&execution.id)
                    .expect_states(&[ExecutionStateType::New])
                    .allocated_resources(usage);
                let update = if wait_for_approval {
                    update.compute_state(ExecutionStateType::AskForBidAccepted, reason.clone())
                } else {
                    update
                        .compute_state(ExecutionStateType::BidAccepted, reason.clone())
                        .desired_state(ExecutionDesiredState::Running, "bid accepted")
                };
                let Some(updated) = self.persist(update) else {
                    return;
                };
                info!(
                    execution_id = %updated.id,
                    node_id = %inner.node_id,
                    usage = %updated.allocated_resources,
                    "bid accepted"
                );
                inner.metrics.increment_counter(BIDS_TOTAL, &[("decision", "accepted")]);
                inner
                    .callback
                    .on_bid_complete(BidResult {
                        routing: reply.clone(),
                        execution_metadata: ExecutionMetadata::of(&updated),
                        accepted: true,
                        reason,
                        direct_run: !wait_for_approval,
                    })
                    .await;

                if !wait_for_approval {
                    if let Err(e) = inner.buffer.run(updated.clone()) {
                        warn!(execution_id = %updated.id, error = %e, "failed to enqueue execution");
                        self.fail(&updated, ExecutionStateType::BidAccepted, e.to_string(), reply)
                            .await;
                    }
                }
            }
            BidDecision::Reject { reason } => {
                let update = UpdateExecutionRequest::new(&execution.id)
                    .expect_states(&[ExecutionStateType::New])
                    .compute_state(ExecutionStateType::AskForBidRejected, reason.clone())
                    .desired_state(ExecutionDesiredState::Stopped, "bid rejected");
                let Some(updated) = self.persist(update) else {
                    return;
                };
                info!(execution_id = %updated.id, node_id = %inner.node_id, %reason, "bid rejected");
                inner.metrics.increment_counter(BIDS_TOTAL, &[("decision", "rejected")]);
                inner
                    .callback
                    .on_bid_complete(BidResult {
                        routing: reply,
                        execution_metadata: ExecutionMetadata::of(&updated),
                        accepted: false,
                        reason,
                        direct_run: false,
                    })
                    .await;
            }
        }
    }

    /// Apply an update; `None` if it lost a race or the store failed.
    fn persist(&self, update: UpdateExecutionRequest) -> Option<Execution> {
        let execution_id = update.execution_id.clone();
        match self.inner.store.update_execution_state(update) {
            Ok(updated) => Some(updated),
            Err(e) if e.is_conflict() => {
                debug!(%execution_id, error = %e, "stale bidding request ignored");
                None
            }
            Err(e) => {
                warn!(%execution_id, error = %e, "failed to record bid");
                None
            }
        }
    }

    async fn fail(
        &self,
        execution: &Execution,
        expected: ExecutionStateType,
        message: String,
        routing: RoutingMetadata,
    ) {
        let update = UpdateExecutionRequest::new(&execution.id)
            .expect_states(&[expected])
            .compute_state(ExecutionStateType::Failed, message.clone())
            .desired_state(ExecutionDesiredState::Stopped, message.clone());
        if self.persist(update).is_none() {
            return;
        }
        self.inner
            .callback
            .on_compute_failure(ComputeFailure {
                routing,
                execution_metadata: ExecutionMetadata::of(execution),
                message,
            })
            .await;
    }
}
