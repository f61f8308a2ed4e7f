//! Resource bid strategies: decisions on the estimated usage.

use std::sync::Arc;

use async_trait::async_trait;

use jobgrid_core::{Job, Resources};

use super::{BidStrategyResponse, ResourceBidStrategy};
use crate::capacity::{EnqueuedUsageTracker, ResourceCapacityTracker};
use crate::error::ComputeResult;

/// Usage must fit the node's per-job limit.
#[derive(Debug, Clone)]
pub struct MaxCapacityStrategy {
    job_limits: Resources,
}

impl MaxCapacityStrategy {
    pub fn new(job_limits: Resources) -> Self {
        Self { job_limits }
    }
}

#[async_trait]
impl ResourceBidStrategy for MaxCapacityStrategy {
    fn name(&self) -> &'static str {
        "max-capacity"
    }

    async fn should_bid_based_on_usage(
        &self,
        _job: &Job,
        usage: &Resources,
    ) -> ComputeResult<BidStrategyResponse> {
        if usage.less_than_eq(&self.job_limits) {
            Ok(BidStrategyResponse::bid("job fits the per-job limit"))
        } else {
            Ok(BidStrategyResponse::reject(format!(
                "job requires {usage}, more than the per-job limit {}",
                self.job_limits
            )))
        }
    }
}

/// Rejects when running plus queued work plus this job would exceed the
/// node's capacity extended by `queue_capacity`.
pub struct AvailableCapacityStrategy {
    running: Arc<ResourceCapacityTracker>,
    enqueued: Arc<EnqueuedUsageTracker>,
    queue_capacity: Resources,
}

impl AvailableCapacityStrategy {
    pub fn new(
        running: Arc<ResourceCapacityTracker>,
        enqueued: Arc<EnqueuedUsageTracker>,
        queue_capacity: Resources,
    ) -> Self {
        Self {
            running,
            enqueued,
            queue_capacity,
        }
    }
}

#[async_trait]
impl ResourceBidStrategy for AvailableCapacityStrategy {
    fn name(&self) -> &'static str {
        "available-capacity"
    }

    async fn should_bid_based_on_usage(
        &self,
        _job: &Job,
        usage: &Resources,
    ) -> ComputeResult<BidStrategyResponse> {
        let budget = self.running.get_max_capacity().add(&self.queue_capacity);
        let pressure = self
            .running
            .get_used_capacity()
            .add(&self.enqueued.get_used_capacity())
            .add(usage);
        if pressure.less_than_eq(&budget) {
            Ok(BidStrategyResponse::bid("node has room for the job"))
        } else {
            Ok(BidStrategyResponse::reject(format!(
                "node is at capacity: {pressure} needed, {budget} available including queue"
            )))
        }
    }
}
