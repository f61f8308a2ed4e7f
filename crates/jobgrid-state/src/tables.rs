//! redb table definitions for the JobGrid store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Jobs keyed by `{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Executions keyed by `{job_id}:{execution_id}`, so a job's executions
/// are one prefix scan.
pub const EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");

/// Execution ID → owning job ID, for point lookups by execution.
pub const EXECUTION_JOBS: TableDefinition<&str, &str> = TableDefinition::new("execution_jobs");
