//! Node selection: discover, rank, filter, order.

use std::sync::Arc;

use tracing::debug;

use jobgrid_core::Job;

use crate::discovery::NodeDiscoverer;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ranking::{NodeRank, NodeRanker};

pub struct NodeSelector {
    discoverer: Arc<dyn NodeDiscoverer>,
    ranker: Arc<dyn NodeRanker>,
}

impl NodeSelector {
    pub fn new(discoverer: Arc<dyn NodeDiscoverer>, ranker: Arc<dyn NodeRanker>) -> Self {
        Self { discoverer, ranker }
    }

    /// Pick up to `desired_count` suitable nodes for `job`, best first.
    ///
    /// Fails with [`OrchestratorError::NotEnoughNodes`] when fewer than
    /// `min_count` nodes are suitable. Ties are broken by node ID so the
    /// order is stable for equal ranks.
    pub fn select_nodes(
        &self,
        job: &Job,
        min_count: usize,
        desired_count: usize,
    ) -> OrchestratorResult<Vec<NodeRank>> {
        let nodes: Vec<_> = self
            .discoverer
            .list_nodes()?
            .into_iter()
            .filter(|n| n.is_compute())
            .collect();

        let mut suitable: Vec<NodeRank> = self
            .ranker
            .rank_nodes(job, &nodes)?
            .into_iter()
            .filter(|rank| {
                if !rank.is_suitable() {
                    debug!(
                        job_id = %job.id,
                        node_id = %rank.node.id,
                        reason = %rank.reason,
                        "node filtered out"
                    );
                }
                rank.is_suitable()
            })
            .collect();

        if suitable.len() < min_count {
            return Err(OrchestratorError::NotEnoughNodes {
                requested: min_count,
                available: suitable.len(),
            });
        }

        suitable.sort_by(|a, b| b.rank.cmp(&a.rank).then_with(|| a.node.id.cmp(&b.node.id)));
        suitable.truncate(desired_count.max(min_count));

        debug!(
            job_id = %job.id,
            selected = ?suitable.iter().map(|r| (r.node.id.as_str(), r.rank)).collect::<Vec<_>>(),
            "selected nodes"
        );
        Ok(suitable)
    }
}
