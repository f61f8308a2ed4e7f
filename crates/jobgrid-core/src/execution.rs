//! Execution types.
//!
//! An `Execution` is one attempt to run a job on one node. Both node roles
//! keep their own copy in their own store and only ever change it through
//! conditional (compare-and-swap) updates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};
use crate::node::NodeId;
use crate::resources::Resources;
use crate::{epoch_millis, ids};

/// Unique identifier for an execution.
pub type ExecutionId = String;

/// Observed state of an execution.
///
/// The orchestrator walks `New → AskForBidAccepted → BidAccepted →
/// ResultProposed → ResultAccepted → Completed`; the compute node
/// additionally passes through `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStateType {
    New,
    AskForBidAccepted,
    AskForBidRejected,
    BidAccepted,
    BidRejected,
    Running,
    ResultProposed,
    ResultAccepted,
    ResultRejected,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStateType {
    /// States that no longer count towards a job's live executions.
    pub fn is_discarded(self) -> bool {
        matches!(
            self,
            Self::AskForBidRejected
                | Self::BidRejected
                | Self::ResultRejected
                | Self::Failed
                | Self::Cancelled
        )
    }

    pub fn is_terminal(self) -> bool {
        self.is_discarded() || self == Self::Completed
    }

    /// The node said yes to the ask-for-bid at some point.
    pub fn has_accepted_ask_for_bid(self) -> bool {
        matches!(
            self,
            Self::AskForBidAccepted
                | Self::BidAccepted
                | Self::Running
                | Self::ResultProposed
                | Self::ResultAccepted
                | Self::Completed
        )
    }

    /// The orchestrator accepted the bid; the execution occupies a
    /// concurrency slot of its job.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::BidAccepted
                | Self::Running
                | Self::ResultProposed
                | Self::ResultAccepted
                | Self::Completed
        )
    }

    pub fn non_terminal() -> Vec<ExecutionStateType> {
        ALL_STATES
            .iter()
            .copied()
            .filter(|s| !s.is_terminal())
            .collect()
    }
}

const ALL_STATES: [ExecutionStateType; 12] = [
    ExecutionStateType::New,
    ExecutionStateType::AskForBidAccepted,
    ExecutionStateType::AskForBidRejected,
    ExecutionStateType::BidAccepted,
    ExecutionStateType::BidRejected,
    ExecutionStateType::Running,
    ExecutionStateType::ResultProposed,
    ExecutionStateType::ResultAccepted,
    ExecutionStateType::ResultRejected,
    ExecutionStateType::Completed,
    ExecutionStateType::Failed,
    ExecutionStateType::Cancelled,
];

impl fmt::Display for ExecutionStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the orchestrator wants the execution to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionDesiredState {
    Pending,
    Running,
    Stopped,
}

/// A state value with a reason and the time it was set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State<T> {
    pub state: T,
    pub message: String,
    pub updated_at: u64,
}

impl<T> State<T> {
    pub fn new(state: T) -> Self {
        Self::with_message(state, "")
    }

    pub fn with_message(state: T, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            updated_at: epoch_millis(),
        }
    }
}

/// Output captured from an engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error_message: String,
}

/// Where a publisher stored an execution's results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedResult {
    pub kind: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub node_id: NodeId,
    /// Snapshot of the job at the time the execution was created.
    pub job: Job,
    pub compute_state: State<ExecutionStateType>,
    pub desired_state: State<ExecutionDesiredState>,
    /// Resources granted by the compute node; may differ from the request
    /// (e.g. specific GPU indices).
    pub allocated_resources: Resources,
    pub run_output: Option<RunCommandResult>,
    pub published_result: Option<PublishedResult>,
    /// Incremented on every persisted update.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Execution {
    /// Create a new execution of `job` on `node_id` in state `New`.
    pub fn new(job: &Job, node_id: &str) -> Self {
        let now = epoch_millis();
        Self {
            id: ids::new_id("e"),
            job_id: job.id.clone(),
            node_id: node_id.to_string(),
            job: job.clone(),
            compute_state: State::new(ExecutionStateType::New),
            desired_state: State::new(ExecutionDesiredState::Pending),
            allocated_resources: Resources::default(),
            run_output: None,
            published_result: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> ExecutionStateType {
        self.compute_state.state
    }

    pub fn priority(&self) -> i32 {
        self.job.priority
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Task;

    #[test]
    fn discarded_and_terminal_sets() {
        use ExecutionStateType::*;
        for s in [AskForBidRejected, BidRejected, ResultRejected, Failed, Cancelled] {
            assert!(s.is_discarded(), "{s} should be discarded");
            assert!(s.is_terminal());
        }
        assert!(Completed.is_terminal());
        assert!(!Completed.is_discarded());
        for s in [New, AskForBidAccepted, BidAccepted, Running, ResultProposed, ResultAccepted] {
            assert!(!s.is_terminal(), "{s} should be live");
        }
    }

    #[test]
    fn non_terminal_list_matches_predicate() {
        let live = ExecutionStateType::non_terminal();
        assert_eq!(live.len(), 6);
        assert!(live.iter().all(|s| !s.is_terminal()));
    }

    #[test]
    fn accepted_bid_and_active() {
        use ExecutionStateType::*;
        assert!(AskForBidAccepted.has_accepted_ask_for_bid());
        assert!(!AskForBidAccepted.is_active());
        assert!(BidAccepted.is_active());
        assert!(Completed.has_accepted_ask_for_bid());
        assert!(!New.has_accepted_ask_for_bid());
        assert!(!Failed.is_active());
    }

    #[test]
    fn new_execution_snapshots_job() {
        let job = Job::new("j", Task::new("noop")).with_priority(7);
        let exec = Execution::new(&job, "node-1");
        assert_eq!(exec.job_id, job.id);
        assert_eq!(exec.priority(), 7);
        assert_eq!(exec.state(), ExecutionStateType::New);
        assert_eq!(exec.desired_state.state, ExecutionDesiredState::Pending);
        assert!(exec.id.starts_with("e-"));
    }
}
