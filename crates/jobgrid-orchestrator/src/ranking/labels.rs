use jobgrid_core::{Job, NodeInfo};

use super::{NodeRank, NodeRanker, RANK_POSSIBLE, RANK_PREFERRED, RANK_UNSUITABLE};
use crate::error::OrchestratorResult;

/// Applies the job's label constraints. A job without constraints can run
/// anywhere; a node matching all of them is preferred.
#[derive(Debug, Default)]
pub struct LabelsNodeRanker;

impl LabelsNodeRanker {
    pub fn new() -> Self {
        Self
    }
}

impl NodeRanker for LabelsNodeRanker {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn rank_nodes(&self, job: &Job, nodes: &[NodeInfo]) -> OrchestratorResult<Vec<NodeRank>> {
        Ok(nodes
            .iter()
            .map(|node| {
                if job.constraints.is_empty() {
                    return NodeRank::new(node, RANK_POSSIBLE, "no label constraints");
                }
                match job.constraints.iter().find(|c| !c.matches(&node.labels)) {
                    None => NodeRank::new(node, RANK_PREFERRED, "all label constraints match"),
                    Some(failed) => {
                        NodeRank::new(node, RANK_UNSUITABLE, format!("label constraint {failed} not met"))
                    }
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::tests::node;
    use jobgrid_core::{LabelSelector, SelectorOperator, Task};
    use std::collections::HashMap;

    #[test]
    fn constraints_decide_suitability() {
        let east = node("east").with_labels(HashMap::from([("zone".to_string(), "east".to_string())]));
        let west = node("west").with_labels(HashMap::from([("zone".to_string(), "west".to_string())]));
        let nodes = [east, west];

        let free = Job::new("j", Task::new("noop"));
        let ranks = LabelsNodeRanker::new().rank_nodes(&free, &nodes).unwrap();
        assert!(ranks.iter().all(|r| r.rank == RANK_POSSIBLE));

        let pinned = Job::new("j", Task::new("noop"))
            .with_constraints(vec![LabelSelector::new("zone", SelectorOperator::In, &["east"])]);
        let ranks = LabelsNodeRanker::new().rank_nodes(&pinned, &nodes).unwrap();
        assert_eq!(ranks[0].rank, RANK_PREFERRED);
        assert_eq!(ranks[1].rank, RANK_UNSUITABLE);
    }
}
