//! Orchestrator error types.

use thiserror::Error;

use jobgrid_core::CoreError;
use jobgrid_state::StateError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not enough nodes: requested {requested}, {available} suitable")]
    NotEnoughNodes { requested: usize, available: usize },

    #[error("job {0} is already in a terminal state")]
    JobAlreadyTerminal(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("ranker {name} failed: {message}")]
    Ranking { name: &'static str, message: String },

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
