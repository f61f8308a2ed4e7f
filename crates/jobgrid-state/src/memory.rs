//! In-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use jobgrid_core::sync::MutexExt;
use jobgrid_core::{Execution, Job};

use crate::error::{StateError, StateResult};
use crate::store::{
    ExecutionStore, JobStore, UpdateExecutionRequest, UpdateJobStateRequest,
    apply_execution_update, apply_job_update, sort_executions,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    executions: HashMap<String, Execution>,
}

/// Thread-safe in-memory store. Cloning shares the underlying data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for InMemoryStore {
    fn create_execution(&self, execution: &Execution) -> StateResult<()> {
        let mut inner = self.inner.lock_unpoisoned();
        if inner.executions.contains_key(&execution.id) {
            return Err(StateError::AlreadyExists(execution.id.clone()));
        }
        inner
            .executions
            .insert(execution.id.clone(), execution.clone());
        debug!(execution_id = %execution.id, job_id = %execution.job_id, "execution stored");
        Ok(())
    }

    fn get_execution(&self, execution_id: &str) -> StateResult<Execution> {
        self.inner
            .lock_unpoisoned()
            .executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| StateError::NotFound(execution_id.to_string()))
    }

    fn get_executions(&self, job_id: &str) -> StateResult<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .inner
            .lock_unpoisoned()
            .executions
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        sort_executions(&mut executions);
        Ok(executions)
    }

    fn get_live_executions(&self) -> StateResult<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .inner
            .lock_unpoisoned()
            .executions
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect();
        sort_executions(&mut executions);
        Ok(executions)
    }

    fn update_execution_state(&self, request: UpdateExecutionRequest) -> StateResult<Execution> {
        let mut inner = self.inner.lock_unpoisoned();
        let execution = inner
            .executions
            .get_mut(&request.execution_id)
            .ok_or_else(|| StateError::NotFound(request.execution_id.clone()))?;
        apply_execution_update(execution, request)?;
        Ok(execution.clone())
    }
}

impl JobStore for InMemoryStore {
    fn create_job(&self, job: &Job) -> StateResult<()> {
        let mut inner = self.inner.lock_unpoisoned();
        if inner.jobs.contains_key(&job.id) {
            return Err(StateError::AlreadyExists(job.id.clone()));
        }
        inner.jobs.insert(job.id.clone(), job.clone());
        debug!(job_id = %job.id, "job stored");
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> StateResult<Job> {
        self.inner
            .lock_unpoisoned()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| StateError::NotFound(job_id.to_string()))
    }

    fn list_jobs(&self) -> StateResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.inner.lock_unpoisoned().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn update_job_state(&self, request: UpdateJobStateRequest) -> StateResult<Job> {
        let mut inner = self.inner.lock_unpoisoned();
        let job = inner
            .jobs
            .get_mut(&request.job_id)
            .ok_or_else(|| StateError::NotFound(request.job_id.clone()))?;
        apply_job_update(job, request)?;
        Ok(job.clone())
    }
}
