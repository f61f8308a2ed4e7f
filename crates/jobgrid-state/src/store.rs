//! Store contracts and the conditional-update primitives they share.

use jobgrid_core::{
    Execution, ExecutionDesiredState, ExecutionStateType, Job, JobState, PublishedResult,
    Resources, RunCommandResult, State, epoch_millis,
};

use crate::error::{StateError, StateResult};

/// Access to executions. Implemented by every backend; compute nodes only
/// need this half.
pub trait ExecutionStore: Send + Sync {
    /// Persist a new execution. Fails with `AlreadyExists` on a duplicate ID.
    fn create_execution(&self, execution: &Execution) -> StateResult<()>;

    fn get_execution(&self, execution_id: &str) -> StateResult<Execution>;

    /// All executions of a job, oldest first.
    fn get_executions(&self, job_id: &str) -> StateResult<Vec<Execution>>;

    /// Executions that have not reached a terminal state.
    fn get_live_executions(&self) -> StateResult<Vec<Execution>>;

    /// Apply `request.new_values` if `request.condition` holds against the
    /// stored execution; returns the updated execution.
    fn update_execution_state(&self, request: UpdateExecutionRequest) -> StateResult<Execution>;
}

/// Access to jobs and their executions. Used by the orchestrator.
pub trait JobStore: ExecutionStore {
    fn create_job(&self, job: &Job) -> StateResult<()>;

    fn get_job(&self, job_id: &str) -> StateResult<Job>;

    fn list_jobs(&self) -> StateResult<Vec<Job>>;

    fn update_job_state(&self, request: UpdateJobStateRequest) -> StateResult<Job>;
}

// ── Execution updates ─────────────────────────────────────────────

/// What the stored execution must look like for an update to apply.
/// Empty fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct UpdateExecutionCondition {
    pub expected_states: Vec<ExecutionStateType>,
    pub expected_version: Option<u64>,
}

/// New values; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub compute_state: Option<State<ExecutionStateType>>,
    pub desired_state: Option<State<ExecutionDesiredState>>,
    pub allocated_resources: Option<Resources>,
    pub run_output: Option<RunCommandResult>,
    pub published_result: Option<PublishedResult>,
}

#[derive(Debug, Clone)]
pub struct UpdateExecutionRequest {
    pub execution_id: String,
    pub condition: UpdateExecutionCondition,
    pub new_values: ExecutionUpdate,
}

impl UpdateExecutionRequest {
    pub fn new(execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            condition: UpdateExecutionCondition::default(),
            new_values: ExecutionUpdate::default(),
        }
    }

    pub fn expect_states(mut self, states: &[ExecutionStateType]) -> Self {
        self.condition.expected_states = states.to_vec();
        self
    }

    pub fn expect_version(mut self, version: u64) -> Self {
        self.condition.expected_version = Some(version);
        self
    }

    pub fn compute_state(mut self, state: ExecutionStateType, message: impl Into<String>) -> Self {
        self.new_values.compute_state = Some(State::with_message(state, message));
        self
    }

    pub fn desired_state(mut self, state: ExecutionDesiredState, message: impl Into<String>) -> Self {
        self.new_values.desired_state = Some(State::with_message(state, message));
        self
    }

    pub fn allocated_resources(mut self, resources: Resources) -> Self {
        self.new_values.allocated_resources = Some(resources);
        self
    }

    pub fn run_output(mut self, output: RunCommandResult) -> Self {
        self.new_values.run_output = Some(output);
        self
    }

    pub fn published_result(mut self, result: PublishedResult) -> Self {
        self.new_values.published_result = Some(result);
        self
    }
}

/// Check `condition` against `execution` and apply `new_values` in place.
pub(crate) fn apply_execution_update(
    execution: &mut Execution,
    request: UpdateExecutionRequest,
) -> StateResult<()> {
    let condition = &request.condition;
    if !condition.expected_states.is_empty()
        && !condition.expected_states.contains(&execution.state())
    {
        return Err(StateError::Conflict {
            id: execution.id.clone(),
            expected: format!("{:?}", condition.expected_states),
            actual: execution.state().to_string(),
        });
    }
    match condition.expected_version {
        Some(version) if version != execution.version => {
            return Err(StateError::Conflict {
                id: execution.id.clone(),
                expected: format!("version {version}"),
                actual: format!("version {}", execution.version),
            });
        }
        _ => {}
    }

    let values = request.new_values;
    if let Some(state) = values.compute_state {
        execution.compute_state = state;
    }
    if let Some(state) = values.desired_state {
        execution.desired_state = state;
    }
    if let Some(resources) = values.allocated_resources {
        execution.allocated_resources = resources;
    }
    if let Some(output) = values.run_output {
        execution.run_output = Some(output);
    }
    if let Some(result) = values.published_result {
        execution.published_result = Some(result);
    }
    execution.version += 1;
    execution.updated_at = epoch_millis();
    Ok(())
}

// ── Job updates ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UpdateJobStateRequest {
    pub job_id: String,
    /// Empty means any state.
    pub expected_states: Vec<JobState>,
    pub new_state: JobState,
    pub message: String,
}

impl UpdateJobStateRequest {
    pub fn new(job_id: &str, new_state: JobState, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            expected_states: Vec::new(),
            new_state,
            message: message.into(),
        }
    }

    pub fn expect_states(mut self, states: &[JobState]) -> Self {
        self.expected_states = states.to_vec();
        self
    }
}

pub(crate) fn apply_job_update(job: &mut Job, request: UpdateJobStateRequest) -> StateResult<()> {
    if !request.expected_states.is_empty() && !request.expected_states.contains(&job.state) {
        return Err(StateError::Conflict {
            id: job.id.clone(),
            expected: format!("{:?}", request.expected_states),
            actual: job.state.to_string(),
        });
    }
    job.state = request.new_state;
    job.state_message = request.message;
    job.version += 1;
    job.updated_at = epoch_millis();
    Ok(())
}

/// Order executions oldest first, ties broken by ID.
pub(crate) fn sort_executions(executions: &mut [Execution]) {
    executions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgrid_core::Task;

    fn execution() -> Execution {
        Execution::new(&Job::new("j", Task::new("noop")), "node-1")
    }

    #[test]
    fn update_applies_when_state_matches() {
        let mut exec = execution();
        let request = UpdateExecutionRequest::new(&exec.id)
            .expect_states(&[ExecutionStateType::New])
            .compute_state(ExecutionStateType::AskForBidAccepted, "ok")
            .allocated_resources(Resources::new(1.0, 0, 0, 0));

        apply_execution_update(&mut exec, request).unwrap();
        assert_eq!(exec.state(), ExecutionStateType::AskForBidAccepted);
        assert_eq!(exec.compute_state.message, "ok");
        assert_eq!(exec.allocated_resources.cpu, 1.0);
        assert_eq!(exec.version, 2);
    }

    #[test]
    fn update_conflicts_on_unexpected_state() {
        let mut exec = execution();
        let before = exec.clone();
        let request = UpdateExecutionRequest::new(&exec.id)
            .expect_states(&[ExecutionStateType::BidAccepted])
            .compute_state(ExecutionStateType::Running, "");

        let err = apply_execution_update(&mut exec, request).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(exec, before);
    }

    #[test]
    fn update_conflicts_on_stale_version() {
        let mut exec = execution();
        let request = UpdateExecutionRequest::new(&exec.id)
            .expect_version(7)
            .desired_state(ExecutionDesiredState::Stopped, "");
        assert!(apply_execution_update(&mut exec, request).unwrap_err().is_conflict());
    }

    #[test]
    fn job_update_checks_expected_states() {
        let mut job = Job::new("j", Task::new("noop"));
        let request = UpdateJobStateRequest::new(&job.id, JobState::InProgress, "")
            .expect_states(&[JobState::New]);
        apply_job_update(&mut job, request).unwrap();
        assert_eq!(job.state, JobState::InProgress);

        let again = UpdateJobStateRequest::new(&job.id, JobState::InProgress, "")
            .expect_states(&[JobState::New]);
        assert!(apply_job_update(&mut job, again).unwrap_err().is_conflict());
        assert_eq!(job.version, 2);
    }
}
