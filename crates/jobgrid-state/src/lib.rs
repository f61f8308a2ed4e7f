//! jobgrid-state: job and execution stores for JobGrid.
//!
//! Every state transition in the system goes through a conditional update:
//! the caller states which execution (or job) states it expects, and the
//! store applies the new values only if the stored record still matches.
//! A stale or duplicate update fails with [`StateError::Conflict`] instead
//! of silently overwriting.
//!
//! Two backends implement the same traits:
//!
//! - **`InMemoryStore`**: `HashMap`s behind a mutex, for tests and the devstack
//! - **`RedbStore`**: [redb](https://docs.rs/redb)-backed, JSON-encoded values;
//!   the compare-and-swap runs inside a single write transaction

pub mod error;
pub mod memory;
pub mod redb_store;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use memory::InMemoryStore;
pub use redb_store::RedbStore;
pub use store::{
    ExecutionStore, ExecutionUpdate, JobStore, UpdateExecutionCondition, UpdateExecutionRequest,
    UpdateJobStateRequest,
};
