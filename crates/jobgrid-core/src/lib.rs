//! jobgrid-core: shared domain model for JobGrid.
//!
//! Both node roles depend on this crate:
//!
//! - **Orchestrator** (requester): accepts jobs, ranks nodes, asks them to
//!   bid, and drives the job/execution state machine.
//! - **Compute**: evaluates bids, admits executions against local capacity,
//!   runs them, and reports back.
//!
//! # Contents
//!
//! - **`resources`**: `Resources` arithmetic and quantity configuration
//! - **`job`** / **`execution`** / **`node`**: persisted domain types
//! - **`protocol`**: the `ComputeEndpoint` and `Callback` contracts
//! - **`metrics`**: injected metrics sink with Prometheus rendering
//! - **`tasks`**: tracked detached task spawning
//! - **`config`**: TOML node configuration

pub mod config;
pub mod error;
pub mod execution;
pub mod ids;
pub mod job;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod quantity;
pub mod resources;
pub mod sync;
pub mod tasks;

pub use error::{CoreError, CoreResult};
pub use execution::*;
pub use job::*;
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, SharedMetrics};
pub use node::*;
pub use resources::{Gpu, GpuVendor, Resources, ResourcesConfig};
pub use tasks::BackgroundTasks;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
