use jobgrid_core::{Job, NodeInfo};

use super::{NodeRank, NodeRanker, RANK_PREFERRED, RANK_UNSUITABLE};
use crate::error::OrchestratorResult;

/// Filters nodes that lack the job's engine, publisher or input storage.
#[derive(Debug, Default)]
pub struct FeatureNodeRanker;

impl FeatureNodeRanker {
    pub fn new() -> Self {
        Self
    }

    fn missing_features(job: &Job, node: &NodeInfo) -> Vec<String> {
        let Some(compute) = &node.compute else {
            return vec!["compute info".to_string()];
        };

        let mut missing = Vec::new();
        let engine = &job.task.engine.kind;
        if !compute.engines.contains(engine) {
            missing.push(format!("engine {engine}"));
        }
        let publisher = &job.task.publisher;
        if !publisher.is_empty() && !compute.publishers.contains(publisher) {
            missing.push(format!("publisher {publisher}"));
        }
        for input in &job.task.inputs {
            if !compute.storage_sources.contains(&input.kind) {
                missing.push(format!("storage {}", input.kind));
            }
        }
        missing
    }
}

impl NodeRanker for FeatureNodeRanker {
    fn name(&self) -> &'static str {
        "features"
    }

    fn rank_nodes(&self, job: &Job, nodes: &[NodeInfo]) -> OrchestratorResult<Vec<NodeRank>> {
        Ok(nodes
            .iter()
            .map(|node| {
                let missing = Self::missing_features(job, node);
                if missing.is_empty() {
                    NodeRank::new(node, RANK_PREFERRED, "all features supported")
                } else {
                    NodeRank::new(node, RANK_UNSUITABLE, format!("missing {}", missing.join(", ")))
                }
            })
            .collect())
    }
}
