//! Node ranking for job placement.
//!
//! Each [`NodeRanker`] scores every candidate node for one job. Ranks are
//! signed integers:
//!
//! - **negative**: the node must not run the job
//! - **zero**: the node can run the job
//! - **positive**: the node is preferred, larger is better
//!
//! [`ChainRanker`] combines rankers by summing ranks. A negative rank from
//! any member is sticky: later positive contributions never lift the node
//! back into the candidate set.

mod features;
mod labels;
mod max_usage;
mod min_version;
mod previous_executions;
mod random;

pub use features::FeatureNodeRanker;
pub use labels::LabelsNodeRanker;
pub use max_usage::MaxUsageNodeRanker;
pub use min_version::MinVersionNodeRanker;
pub use previous_executions::PreviousExecutionsNodeRanker;
pub use random::RandomNodeRanker;

use std::collections::HashMap;
use std::sync::Arc;

use jobgrid_core::{Job, NodeInfo};

use crate::error::OrchestratorResult;

/// The node must not run the job.
pub const RANK_UNSUITABLE: i32 = -1;
/// The node can run the job.
pub const RANK_POSSIBLE: i32 = 0;
/// The node is a good match for the job.
pub const RANK_PREFERRED: i32 = 10;

/// Rank of a single node for a single job.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRank {
    pub node: NodeInfo,
    pub rank: i32,
    /// Human-readable explanation, for logs.
    pub reason: String,
}

impl NodeRank {
    pub fn new(node: &NodeInfo, rank: i32, reason: impl Into<String>) -> Self {
        Self {
            node: node.clone(),
            rank,
            reason: reason.into(),
        }
    }

    pub fn is_suitable(&self) -> bool {
        self.rank >= RANK_POSSIBLE
    }
}

pub trait NodeRanker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rank every node in `nodes`, in the same order.
    fn rank_nodes(&self, job: &Job, nodes: &[NodeInfo]) -> OrchestratorResult<Vec<NodeRank>>;
}

/// Sums the ranks of its members; an unsuitable verdict is final.
#[derive(Default)]
pub struct ChainRanker {
    rankers: Vec<Arc<dyn NodeRanker>>,
}

impl ChainRanker {
    pub fn new(rankers: Vec<Arc<dyn NodeRanker>>) -> Self {
        Self { rankers }
    }

    pub fn with(mut self, ranker: Arc<dyn NodeRanker>) -> Self {
        self.rankers.push(ranker);
        self
    }
}

impl NodeRanker for ChainRanker {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn rank_nodes(&self, job: &Job, nodes: &[NodeInfo]) -> OrchestratorResult<Vec<NodeRank>> {
        let mut totals: Vec<NodeRank> = nodes
            .iter()
            .map(|node| NodeRank::new(node, RANK_POSSIBLE, ""))
            .collect();

        for ranker in &self.rankers {
            let ranks: HashMap<String, NodeRank> = ranker
                .rank_nodes(job, nodes)?
                .into_iter()
                .map(|r| (r.node.id.clone(), r))
                .collect();

            for total in &mut totals {
                let Some(contribution) = ranks.get(&total.node.id) else {
                    continue;
                };
                if !total.reason.is_empty() {
                    total.reason.push_str("; ");
                }
                total.reason.push_str(&format!("{}: {}", ranker.name(), contribution.reason));

                if !total.is_suitable() || !contribution.is_suitable() {
                    total.rank = RANK_UNSUITABLE;
                } else {
                    total.rank = total.rank.saturating_add(contribution.rank);
                }
            }
        }
        Ok(totals)
    }
}
