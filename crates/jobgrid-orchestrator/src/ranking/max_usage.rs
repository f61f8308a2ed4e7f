use jobgrid_core::{Job, NodeInfo};

use super::{NodeRank, NodeRanker, RANK_PREFERRED, RANK_UNSUITABLE};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Filters nodes whose per-job limit is smaller than the job's request.
#[derive(Debug, Default)]
pub struct MaxUsageNodeRanker;

impl MaxUsageNodeRanker {
    pub fn new() -> Self {
        Self
    }
}

impl NodeRanker for MaxUsageNodeRanker {
    fn name(&self) -> &'static str {
        "max-usage"
    }

    fn rank_nodes(&self, job: &Job, nodes: &[NodeInfo]) -> OrchestratorResult<Vec<NodeRank>> {
        let requested = job
            .task
            .resources
            .to_resources()
            .map_err(|e| OrchestratorError::Ranking {
                name: self.name(),
                message: e.to_string(),
            })?;

        Ok(nodes
            .iter()
            .map(|node| match &node.compute {
                Some(compute) if requested.less_than_eq(&compute.max_job_requirements) => {
                    NodeRank::new(node, RANK_PREFERRED, "job fits the per-job limit")
                }
                Some(compute) => NodeRank::new(
                    node,
                    RANK_UNSUITABLE,
                    format!("job needs {requested}, node allows {}", compute.max_job_requirements),
                ),
                None => NodeRank::new(node, RANK_UNSUITABLE, "no compute info"),
            })
            .collect())
    }
}
