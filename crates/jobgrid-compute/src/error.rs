//! Compute node error types.

use std::time::Duration;

use thiserror::Error;

use jobgrid_core::CoreError;
use jobgrid_state::StateError;

/// Errors raised on the compute side.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// The execution can never run on this node.
    #[error("execution {execution_id} requests {requested}, more than the node's total capacity {capacity}")]
    ExceedsTotalCapacity {
        execution_id: String,
        requested: String,
        capacity: String,
    },

    #[error("execution {0} is already queued or running")]
    DuplicateExecution(String),

    #[error("bid strategy {name} failed: {message}")]
    Strategy { name: &'static str, message: String },

    #[error("usage calculator {name} failed: {message}")]
    Calculator { name: &'static str, message: String },

    #[error("execution {execution_id} timed out after {timeout:?}")]
    Timeout {
        execution_id: String,
        timeout: Duration,
    },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("publisher error: {0}")]
    Publisher(String),

    #[error("store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type ComputeResult<T> = Result<T, ComputeError>;

impl ComputeError {
    /// A compare-and-swap in the local store lost against another update.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ComputeError::State(e) if e.is_conflict())
    }
}
