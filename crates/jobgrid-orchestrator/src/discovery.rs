//! Node discovery.

use std::collections::BTreeMap;
use std::sync::Mutex;

use jobgrid_core::NodeInfo;
use jobgrid_core::sync::MutexExt;

use crate::error::OrchestratorResult;

/// Source of candidate nodes for selection.
pub trait NodeDiscoverer: Send + Sync {
    fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>>;
}

/// A static, mutable set of nodes, ordered by node ID.
#[derive(Debug, Default)]
pub struct InMemoryNodeDiscoverer {
    nodes: Mutex<BTreeMap<String, NodeInfo>>,
}

impl InMemoryNodeDiscoverer {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            nodes: Mutex::new(nodes.into_iter().map(|n| (n.id.clone(), n)).collect()),
        }
    }

    /// Insert or replace a node.
    pub fn add(&self, node: NodeInfo) {
        self.nodes.lock_unpoisoned().insert(node.id.clone(), node);
    }

    pub fn remove(&self, node_id: &str) -> bool {
        self.nodes.lock_unpoisoned().remove(node_id).is_some()
    }
}

impl NodeDiscoverer for InMemoryNodeDiscoverer {
    fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>> {
        Ok(self.nodes.lock_unpoisoned().values().cloned().collect())
    }
}
