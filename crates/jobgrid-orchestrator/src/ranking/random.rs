use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use jobgrid_core::sync::MutexExt;
use jobgrid_core::{Job, NodeInfo};

use super::{NodeRank, NodeRanker};
use crate::error::OrchestratorResult;

/// Adds jitter in `0..=factor` so equally ranked nodes share load.
pub struct RandomNodeRanker {
    factor: u32,
    rng: Mutex<StdRng>,
}

impl RandomNodeRanker {
    pub fn new(factor: u32) -> Self {
        Self {
            factor,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic jitter for tests.
    pub fn with_seed(factor: u32, seed: u64) -> Self {
        Self {
            factor,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl NodeRanker for RandomNodeRanker {
    fn name(&self) -> &'static str {
        "random"
    }

    fn rank_nodes(&self, _job: &Job, nodes: &[NodeInfo]) -> OrchestratorResult<Vec<NodeRank>> {
        let mut rng = self.rng.lock_unpoisoned();
        Ok(nodes
            .iter()
            .map(|node| {
                let jitter = rng.gen_range(0..=self.factor);
                NodeRank::new(node, i32::try_from(jitter).unwrap_or(i32::MAX), "random jitter")
            })
            .collect())
    }
}
