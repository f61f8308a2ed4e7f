use std::collections::HashSet;
use std::sync::Arc;

use jobgrid_core::{Job, NodeInfo};
use jobgrid_state::ExecutionStore;

use super::{NodeRank, NodeRanker, RANK_POSSIBLE, RANK_UNSUITABLE};
use crate::error::OrchestratorResult;

/// Never places a job on a node that already had an execution of it, so
/// retries land on fresh nodes.
pub struct PreviousExecutionsNodeRanker {
    store: Arc<dyn ExecutionStore>,
}

impl PreviousExecutionsNodeRanker {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }
}

impl NodeRanker for PreviousExecutionsNodeRanker {
    fn name(&self) -> &'static str {
        "previous-executions"
    }

    fn rank_nodes(&self, job: &Job, nodes: &[NodeInfo]) -> OrchestratorResult<Vec<NodeRank>> {
        let used: HashSet<String> = self
            .store
            .get_executions(&job.id)?
            .into_iter()
            .map(|e| e.node_id)
            .collect();

        Ok(nodes
            .iter()
            .map(|node| {
                if used.contains(&node.id) {
                    NodeRank::new(node, RANK_UNSUITABLE, "already executed this job")
                } else {
                    NodeRank::new(node, RANK_POSSIBLE, "no previous execution")
                }
            })
            .collect())
    }
}
