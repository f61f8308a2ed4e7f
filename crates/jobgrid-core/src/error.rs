//! Core error types.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors shared by both node roles.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Removing more than is held. Always a caller bug, never user input.
    #[error("resource underflow: cannot remove {remove} from {available}")]
    ResourceUnderflow { available: String, remove: String },

    #[error("invalid quantity '{input}': {reason}")]
    InvalidQuantity { input: String, reason: String },

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("remote error from {node_id}: {message}")]
    Remote { node_id: String, message: String },
}
