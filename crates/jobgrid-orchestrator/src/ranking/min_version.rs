use semver::Version;

use jobgrid_core::{Job, NodeInfo};

use super::{NodeRank, NodeRanker, RANK_POSSIBLE, RANK_UNSUITABLE};
use crate::error::OrchestratorResult;

/// Filters nodes running a version older than `min_version`. Nodes that
/// report no version (development builds) are always accepted.
#[derive(Debug, Clone)]
pub struct MinVersionNodeRanker {
    min_version: Version,
}

impl MinVersionNodeRanker {
    pub fn new(min_version: Version) -> Self {
        Self { min_version }
    }
}

impl NodeRanker for MinVersionNodeRanker {
    fn name(&self) -> &'static str {
        "min-version"
    }

    fn rank_nodes(&self, _job: &Job, nodes: &[NodeInfo]) -> OrchestratorResult<Vec<NodeRank>> {
        Ok(nodes
            .iter()
            .map(|node| match &node.version {
                None => NodeRank::new(node, RANK_POSSIBLE, "development build"),
                Some(version) if *version < self.min_version => NodeRank::new(
                    node,
                    RANK_UNSUITABLE,
                    format!("version {version} is older than {}", self.min_version),
                ),
                Some(version) => NodeRank::new(node, RANK_POSSIBLE, format!("version {version}")),
            })
            .collect())
    }
}
