//! RedbStore: redb-backed persistence for jobs and executions.
//!
//! Values are JSON-serialized into `&[u8]` columns. Conditional updates
//! read, check and write inside one write transaction; redb serializes
//! write transactions, so two racing updates cannot both pass the check.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use jobgrid_core::{Execution, Job};

use crate::error::{StateError, StateResult};
use crate::store::{
    ExecutionStore, JobStore, UpdateExecutionRequest, UpdateJobStateRequest,
    apply_execution_update, apply_job_update, sort_executions,
};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn execution_key(job_id: &str, execution_id: &str) -> String {
    format!("{job_id}:{execution_id}")
}

/// Half-open key range covering every execution of `job_id`.
/// `;` is the byte after `:`.
fn job_prefix_range(job_id: &str) -> (String, String) {
    (format!("{job_id}:"), format!("{job_id};"))
}

/// Thread-safe store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "redb store opened");
        Ok(store)
    }

    /// Ephemeral in-memory database.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory redb store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        txn.open_table(EXECUTION_JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn job_id_of(&self, execution_id: &str) -> StateResult<String> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTION_JOBS).map_err(map_err!(Table))?;
        match table.get(execution_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(guard.value().to_string()),
            None => Err(StateError::NotFound(execution_id.to_string())),
        }
    }
}

impl ExecutionStore for RedbStore {
    fn create_execution(&self, execution: &Execution) -> StateResult<()> {
        let key = execution_key(&execution.job_id, &execution.id);
        let value = encode(execution)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut index = txn.open_table(EXECUTION_JOBS).map_err(map_err!(Table))?;
            if index
                .get(execution.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::AlreadyExists(execution.id.clone()));
            }
            index
                .insert(execution.id.as_str(), execution.job_id.as_str())
                .map_err(map_err!(Write))?;

            let mut table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "execution stored");
        Ok(())
    }

    fn get_execution(&self, execution_id: &str) -> StateResult<Execution> {
        let job_id = self.job_id_of(execution_id)?;
        let key = execution_key(&job_id, execution_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value()),
            None => Err(StateError::NotFound(execution_id.to_string())),
        }
    }

    fn get_executions(&self, job_id: &str) -> StateResult<Vec<Execution>> {
        let (start, end) = job_prefix_range(job_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range::<&str>(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode::<Execution>(value.value())?);
        }
        sort_executions(&mut results);
        Ok(results)
    }

    fn get_live_executions(&self) -> StateResult<Vec<Execution>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let execution: Execution = decode(value.value())?;
            if !execution.is_terminal() {
                results.push(execution);
            }
        }
        sort_executions(&mut results);
        Ok(results)
    }

    fn update_execution_state(&self, request: UpdateExecutionRequest) -> StateResult<Execution> {
        let job_id = self.job_id_of(&request.execution_id)?;
        let key = execution_key(&job_id, &request.execution_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
            let stored = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(request.execution_id.clone()))?;
            let mut execution: Execution = decode(&stored)?;
            apply_execution_update(&mut execution, request)?;
            let value = encode(&execution)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            execution
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            execution_id = %updated.id,
            state = %updated.state(),
            version = updated.version,
            "execution updated"
        );
        Ok(updated)
    }
}

impl JobStore for RedbStore {
    fn create_job(&self, job: &Job) -> StateResult<()> {
        let value = encode(job)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            if table.get(job.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(job.id.clone()));
            }
            table
                .insert(job.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = %job.id, "job stored");
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> StateResult<Job> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(job_id).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value()),
            None => Err(StateError::NotFound(job_id.to_string())),
        }
    }

    fn list_jobs(&self) -> StateResult<Vec<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results: Vec<Job> = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(results)
    }

    fn update_job_state(&self, request: UpdateJobStateRequest) -> StateResult<Job> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let stored = table
                .get(request.job_id.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(request.job_id.clone()))?;
            let mut job: Job = decode(&stored)?;
            apply_job_update(&mut job, request)?;
            let value = encode(&job)?;
            table
                .insert(job.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            job
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = %updated.id, state = %updated.state, "job updated");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgrid_core::{ExecutionStateType, JobState, Resources, Task};

    fn job() -> Job {
        Job::new("redb-job", Task::new("noop"))
    }

    #[test]
    fn job_crud() {
        let store = RedbStore::open_in_memory().unwrap();
        let job = job();
        store.create_job(&job).unwrap();
        assert_eq!(store.get_job(&job.id).unwrap(), job);
        assert!(matches!(
            store.create_job(&job),
            Err(StateError::AlreadyExists(_))
        ));
        assert!(matches!(store.get_job("nope"), Err(StateError::NotFound(_))));

        let updated = store
            .update_job_state(
                UpdateJobStateRequest::new(&job.id, JobState::InProgress, "")
                    .expect_states(&[JobState::New]),
            )
            .unwrap();
        assert_eq!(updated.state, JobState::InProgress);
        assert_eq!(store.list_jobs().unwrap(), vec![updated]);
    }

    #[test]
    fn executions_are_scoped_by_job() {
        let store = RedbStore::open_in_memory().unwrap();
        let a = job();
        let b = job();
        let a1 = Execution::new(&a, "n1");
        let a2 = Execution::new(&a, "n2");
        let b1 = Execution::new(&b, "n1");
        for exec in [&a1, &a2, &b1] {
            store.create_execution(exec).unwrap();
        }

        let ids: Vec<String> = store
            .get_executions(&a.id)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a1.id) && ids.contains(&a2.id));
        assert_eq!(store.get_execution(&b1.id).unwrap(), b1);
        assert!(store.create_execution(&b1).is_err());
    }

    #[test]
    fn conditional_update() {
        let store = RedbStore::open_in_memory().unwrap();
        let job = job();
        let exec = Execution::new(&job, "n1");
        store.create_execution(&exec).unwrap();

        let updated = store
            .update_execution_state(
                UpdateExecutionRequest::new(&exec.id)
                    .expect_states(&[ExecutionStateType::New])
                    .compute_state(ExecutionStateType::AskForBidAccepted, "")
                    .allocated_resources(Resources::new(0.5, 1024, 0, 0)),
            )
            .unwrap();
        assert_eq!(updated.version, 2);

        let err = store
            .update_execution_state(
                UpdateExecutionRequest::new(&exec.id)
                    .expect_version(1)
                    .compute_state(ExecutionStateType::Failed, ""),
            )
            .unwrap_err();
        assert!(err.is_conflict());

        let stored = store.get_execution(&exec.id).unwrap();
        assert_eq!(stored.state(), ExecutionStateType::AskForBidAccepted);
        assert_eq!(stored.allocated_resources.memory, 1024);
        assert_eq!(store.get_live_executions().unwrap().len(), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobgrid.redb");
        let job = job();
        let exec = Execution::new(&job, "n1");
        {
            let store = RedbStore::open(&path).unwrap();
            store.create_job(&job).unwrap();
            store.create_execution(&exec).unwrap();
            store
                .update_execution_state(
                    UpdateExecutionRequest::new(&exec.id)
                        .compute_state(ExecutionStateType::Completed, "done"),
                )
                .unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get_job(&job.id).unwrap().id, job.id);
        let stored = store.get_execution(&exec.id).unwrap();
        assert_eq!(stored.state(), ExecutionStateType::Completed);
        assert!(store.get_live_executions().unwrap().is_empty());
    }
}
