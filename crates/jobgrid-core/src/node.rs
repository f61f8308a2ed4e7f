//! Node information as produced by discovery.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resources::Resources;

/// Unique identifier for a node.
pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Requester,
    Compute,
}

/// What a compute node advertises about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeNodeInfo {
    pub engines: Vec<String>,
    pub publishers: Vec<String>,
    pub storage_sources: Vec<String>,
    pub max_capacity: Resources,
    pub available_capacity: Resources,
    /// Largest single job the node is willing to run.
    pub max_job_requirements: Resources,
    pub running_executions: u32,
    pub enqueued_executions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub node_type: NodeType,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Software version; `None` for development builds.
    pub version: Option<semver::Version>,
    pub compute: Option<ComputeNodeInfo>,
}

impl NodeInfo {
    pub fn compute(id: &str, info: ComputeNodeInfo) -> Self {
        Self {
            id: id.to_string(),
            node_type: NodeType::Compute,
            labels: HashMap::new(),
            version: None,
            compute: Some(info),
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_version(mut self, version: semver::Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn is_compute(&self) -> bool {
        self.node_type == NodeType::Compute && self.compute.is_some()
    }
}
