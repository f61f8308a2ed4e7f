//! Retry policy for jobs that lost executions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jobgrid_core::config::RetryConfig;
use jobgrid_core::sync::MutexExt;

/// Decides whether a job that fell below its minimum live executions gets
/// replacement executions or fails.
pub trait RetryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_retry(&self, job_id: &str) -> bool;
}

/// Always or never retry.
#[derive(Debug, Clone, Copy)]
pub struct FixedRetryStrategy {
    retry: bool,
}

impl FixedRetryStrategy {
    pub fn new(retry: bool) -> Self {
        Self { retry }
    }
}

impl RetryStrategy for FixedRetryStrategy {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn should_retry(&self, _job_id: &str) -> bool {
        self.retry
    }
}

/// Allows at most `max_attempts` retries per job.
#[derive(Debug, Default)]
pub struct BudgetRetryStrategy {
    max_attempts: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl BudgetRetryStrategy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn attempts(&self, job_id: &str) -> u32 {
        self.attempts.lock_unpoisoned().get(job_id).copied().unwrap_or(0)
    }
}

impl RetryStrategy for BudgetRetryStrategy {
    fn name(&self) -> &'static str {
        "budget"
    }

    fn should_retry(&self, job_id: &str) -> bool {
        let mut attempts = self.attempts.lock_unpoisoned();
        let used = attempts.entry(job_id.to_string()).or_insert(0);
        if *used >= self.max_attempts {
            return false;
        }
        *used += 1;
        true
    }
}

pub fn from_config(config: &RetryConfig) -> Arc<dyn RetryStrategy> {
    match config {
        RetryConfig::Fixed { enabled } => Arc::new(FixedRetryStrategy::new(*enabled)),
        RetryConfig::Budget { max_attempts } => Arc::new(BudgetRetryStrategy::new(*max_attempts)),
    }
}
