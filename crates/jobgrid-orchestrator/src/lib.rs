//! jobgrid-orchestrator: the requester side of JobGrid.
//!
//! # Architecture
//!
//! ```text
//! start_job ──▶ NodeSelector ──▶ NodeRanker chain ──▶ NodeDiscoverer
//!     │
//!     ▼
//! Scheduler ──▶ ComputeProxy ──▶ ComputeEndpoint (per node)
//!     ▲                                   │
//!     └──────────── Callback ◀────────────┘
//! ```
//!
//! Every callback updates one execution with a compare-and-swap and then
//! re-runs [`Scheduler::transition_job_state`], an idempotent pass that
//! retries or fails the job, rations accepted bids by concurrency,
//! verifies results, and completes the job.

pub mod discovery;
pub mod error;
pub mod proxy;
pub mod ranking;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod verifier;

pub use discovery::{InMemoryNodeDiscoverer, NodeDiscoverer};
pub use error::{OrchestratorError, OrchestratorResult};
pub use proxy::ComputeProxy;
pub use ranking::{ChainRanker, NodeRank, NodeRanker};
pub use retry::{BudgetRetryStrategy, FixedRetryStrategy, RetryStrategy};
pub use scheduler::{Scheduler, SchedulerParams};
pub use selector::NodeSelector;
pub use verifier::{NoopVerifier, VerificationResult, Verifier};
