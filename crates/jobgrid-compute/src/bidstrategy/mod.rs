//! Bid strategies.
//!
//! A node decides whether to bid in two stages. Semantic strategies look
//! only at the job (engine, publisher, networking, timeouts). Resource
//! strategies look at the estimated usage and only run once every
//! semantic strategy has agreed to bid.

pub mod resource;
pub mod semantic;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use jobgrid_core::{Job, Resources};

use crate::error::ComputeResult;

pub use resource::{AvailableCapacityStrategy, MaxCapacityStrategy};
pub use semantic::{
    EngineSupportStrategy, NetworkingStrategy, PublisherSupportStrategy, TimeoutStrategy,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidStrategyResponse {
    pub should_bid: bool,
    pub reason: String,
}

impl BidStrategyResponse {
    pub fn bid(reason: impl Into<String>) -> Self {
        Self {
            should_bid: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            should_bid: false,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait SemanticBidStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn should_bid(&self, job: &Job) -> ComputeResult<BidStrategyResponse>;
}

#[async_trait]
pub trait ResourceBidStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn should_bid_based_on_usage(
        &self,
        job: &Job,
        usage: &Resources,
    ) -> ComputeResult<BidStrategyResponse>;
}

/// Fold member responses: any rejection rejects, and the rejecting
/// members' reasons are joined with `"; "`.
fn combine(responses: Vec<(&'static str, BidStrategyResponse)>) -> BidStrategyResponse {
    let mut should_bid = true;
    let mut reasons = Vec::new();
    for (name, response) in responses {
        debug!(strategy = name, should_bid = response.should_bid, reason = %response.reason, "bid strategy evaluated");
        if !response.should_bid {
            should_bid = false;
            reasons.push(response.reason);
        }
    }
    BidStrategyResponse {
        should_bid,
        reason: reasons.join("; "),
    }
}

/// Ordered semantic strategies. Every member is evaluated; an error from
/// any member aborts the chain.
#[derive(Clone, Default)]
pub struct ChainedSemanticBidStrategy {
    strategies: Vec<Arc<dyn SemanticBidStrategy>>,
}

impl ChainedSemanticBidStrategy {
    pub fn new(strategies: Vec<Arc<dyn SemanticBidStrategy>>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl SemanticBidStrategy for ChainedSemanticBidStrategy {
    fn name(&self) -> &'static str {
        "semantic-chain"
    }

    async fn should_bid(&self, job: &Job) -> ComputeResult<BidStrategyResponse> {
        let mut responses = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            responses.push((strategy.name(), strategy.should_bid(job).await?));
        }
        Ok(combine(responses))
    }
}

/// Ordered resource strategies, combined like [`ChainedSemanticBidStrategy`].
#[derive(Clone, Default)]
pub struct ChainedResourceBidStrategy {
    strategies: Vec<Arc<dyn ResourceBidStrategy>>,
}

impl ChainedResourceBidStrategy {
    pub fn new(strategies: Vec<Arc<dyn ResourceBidStrategy>>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl ResourceBidStrategy for ChainedResourceBidStrategy {
    fn name(&self) -> &'static str {
        "resource-chain"
    }

    async fn should_bid_based_on_usage(
        &self,
        job: &Job,
        usage: &Resources,
    ) -> ComputeResult<BidStrategyResponse> {
        let mut responses = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            responses.push((
                strategy.name(),
                strategy.should_bid_based_on_usage(job, usage).await?,
            ));
        }
        Ok(combine(responses))
    }
}

/// Always answers the same way. Usable in either stage.
#[derive(Debug, Clone, Copy)]
pub struct FixedBidStrategy {
    should_bid: bool,
}

impl FixedBidStrategy {
    pub fn new(should_bid: bool) -> Self {
        Self { should_bid }
    }

    fn response(&self) -> BidStrategyResponse {
        if self.should_bid {
            BidStrategyResponse::bid("fixed strategy always bids")
        } else {
            BidStrategyResponse::reject("fixed strategy never bids")
        }
    }
}

#[async_trait]
impl SemanticBidStrategy for FixedBidStrategy {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn should_bid(&self, _job: &Job) -> ComputeResult<BidStrategyResponse> {
        Ok(self.response())
    }
}

#[async_trait]
impl ResourceBidStrategy for FixedBidStrategy {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn should_bid_based_on_usage(
        &self,
        _job: &Job,
        _usage: &Resources,
    ) -> ComputeResult<BidStrategyResponse> {
        Ok(self.response())
    }
}
