//! Job scheduling state machine.
//!
//! [`Scheduler::start_job`] selects nodes, records one `New` execution per
//! node and asks each of them for a bid. From then on the job is driven
//! entirely by compute callbacks: each one applies a conditional update to
//! a single execution and re-runs [`Scheduler::transition_job_state`].
//!
//! A transition pass is idempotent and runs four steps in order:
//!
//! 1. **Failed executions**: too few live executions either get
//!    replacements (if the retry strategy allows) or stop the job.
//! 2. **Pending bids**: once enough bids arrived, accept up to the job's
//!    concurrency and reject the rest.
//! 3. **Pending results**: once enough results are proposed, verify them.
//! 4. **Completion**: when nothing is left publishing, complete the job.
//!
//! Outbound notifications never run on the caller's task. They go through
//! [`BackgroundTasks`], bounded by the notification timeout, and a failed
//! notification fails its execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use jobgrid_core::metrics::{JOB_RETRIES_TOTAL, JOBS_COMPLETED_TOTAL, JOBS_FAILED_TOTAL};
use jobgrid_core::protocol::{
    AskForBidRequest, BidResult, Callback, CancelResult, ComputeEndpoint, ComputeFailure,
    ExecutionMetadata, ExecutionRequest, PublishResult, RoutingMetadata, RunResult,
};
use jobgrid_core::{
    BackgroundTasks, CoreResult, Execution, ExecutionDesiredState, ExecutionStateType, Job,
    JobState, SharedMetrics,
};
use jobgrid_state::{JobStore, StateError, UpdateExecutionRequest, UpdateJobStateRequest};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ranking::NodeRank;
use crate::retry::RetryStrategy;
use crate::selector::NodeSelector;
use crate::verifier::Verifier;

/// Everything a [`Scheduler`] needs, wired up by the caller.
pub struct SchedulerParams {
    /// The requester node ID, stamped into the routing of every notification.
    pub node_id: String,
    /// The state store for persisting jobs and their executions.
    pub store: Arc<dyn JobStore>,
    /// Picks and ranks the compute nodes to ask for bids.
    pub selector: NodeSelector,
    /// Transport to the compute nodes.
    pub compute: Arc<dyn ComputeEndpoint>,
    /// Decides whether a failed execution is replaced or fails the job.
    pub retry_strategy: Arc<dyn RetryStrategy>,
    pub verifier: Arc<dyn Verifier>,
    /// Nodes asked per bid required.
    pub over_ask_factor: u32,
    /// Upper bound on a single outbound notification.
    pub notification_timeout: Duration,
    pub tasks: BackgroundTasks,
    pub metrics: SharedMetrics,
}

struct SchedulerInner {
    params: SchedulerParams,
    // TODO: per-job locks so passes over unrelated jobs stop serializing.
    lock: tokio::sync::Mutex<()>,
}

/// Drives jobs from submission to a terminal state. Cloning shares the
/// same lock and store.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notification {
    AskForBid,
    BidAccepted,
    BidRejected,
    ResultAccepted,
    ResultRejected,
    Cancel,
}

impl Notification {
    fn as_str(self) -> &'static str {
        match self {
            Notification::AskForBid => "ask_for_bid",
            Notification::BidAccepted => "bid_accepted",
            Notification::BidRejected => "bid_rejected",
            Notification::ResultAccepted => "result_accepted",
            Notification::ResultRejected => "result_rejected",
            Notification::Cancel => "cancel_execution",
        }
    }
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(params: SchedulerParams) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                params,
                lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.params.node_id
    }

    /// The store jobs and executions are persisted in.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.params.store
    }

    /// Wait until every outbound notification (and anything it triggered)
    /// has finished.
    pub async fn wait_for_notifications(&self) {
        self.inner.params.tasks.wait_idle().await;
    }

    /// Persist `job` if it is new, pick nodes and ask them for bids.
    ///
    /// Returns once the executions are recorded; the bid requests go out
    /// in the background. If too few nodes are suitable the job is stopped
    /// with [`JobState::Error`] and the selection error is returned.
    pub async fn start_job(&self, job: Job) -> OrchestratorResult<()> {
        let _guard = self.inner.lock.lock().await;
        let store = &self.inner.params.store;

        match store.create_job(&job) {
            Ok(()) | Err(StateError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let job = store.get_job(&job.id)?;
        if job.state.is_terminal() {
            return Err(OrchestratorError::JobAlreadyTerminal(job.id));
        }
        if job.state != JobState::New {
            debug!(job_id = %job.id, state = %job.state, "job already started");
            return Ok(());
        }

        let min_bids = job.deal.min_bids.max(job.deal.concurrency()) as usize;
        // Every direct-run bid starts running, so there is nothing to ration.
        let desired = if job.direct_run {
            min_bids
        } else {
            min_bids.saturating_mul(self.inner.params.over_ask_factor.max(1) as usize)
        };
        let nodes = match self.inner.params.selector.select_nodes(&job, min_bids, desired) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "no placement for job");
                self.stop_job(&job, JobState::Error, &e.to_string())?;
                return Err(e);
            }
        };

        let job = store.update_job_state(
            UpdateJobStateRequest::new(&job.id, JobState::InProgress, "")
                .expect_states(&[JobState::New]),
        )?;
        let asked = self.launch_executions(&job, &nodes)?;
        info!(job_id = %job.id, asked, min_bids, "job started");
        Ok(())
    }

    /// Stop a job and all of its live executions.
    pub async fn cancel_job(&self, job_id: &str, reason: &str) -> OrchestratorResult<()> {
        let _guard = self.inner.lock.lock().await;

        let job = match self.inner.params.store.get_job(job_id) {
            Ok(job) => job,
            Err(StateError::NotFound(_)) => {
                return Err(OrchestratorError::JobNotFound(job_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if job.state.is_terminal() {
            return Err(OrchestratorError::JobAlreadyTerminal(job_id.to_string()));
        }

        self.stop_job(&job, JobState::Cancelled, reason)?;
        info!(job_id, reason, "job cancelled");
        Ok(())
    }

    /// Re-evaluate a job. Safe to call at any time and any number of times.
    pub async fn transition_job_state(&self, job_id: &str) {
        let _guard = self.inner.lock.lock().await;
        if let Err(e) = self.transition_locked(job_id).await {
            warn!(job_id, error = %e, "job transition failed");
        }
    }

    /// Mark an execution failed and re-evaluate its job.
    pub async fn handle_execution_failure(&self, execution_id: &str, message: &str) {
        let request = UpdateExecutionRequest::new(execution_id)
            .expect_states(&ExecutionStateType::non_terminal())
            .compute_state(ExecutionStateType::Failed, message)
            .desired_state(ExecutionDesiredState::Stopped, message);

        match self.inner.params.store.update_execution_state(request) {
            Ok(execution) => {
                warn!(
                    execution_id,
                    job_id = %execution.job_id,
                    node_id = %execution.node_id,
                    message,
                    "execution failed"
                );
                self.transition_job_state(&execution.job_id).await;
            }
            Err(e) if e.is_conflict() => {
                debug!(execution_id, "failure reported for an execution already terminal");
            }
            Err(e) => warn!(execution_id, error = %e, "failed to record execution failure"),
        }
    }

    async fn transition_locked(&self, job_id: &str) -> OrchestratorResult<()> {
        let store = &self.inner.params.store;
        let job = store.get_job(job_id)?;
        if job.state.is_terminal() {
            debug!(job_id, state = %job.state, "job already terminal");
            return Ok(());
        }

        match self.check_for_failed_executions(&job, &store.get_executions(job_id)?) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => warn!(job_id, error = %e, "checking failed executions"),
        }
        if let Err(e) = self.check_for_pending_bids(&job, &store.get_executions(job_id)?) {
            warn!(job_id, error = %e, "checking pending bids");
        }
        if let Err(e) = self
            .check_for_pending_results(&job, &store.get_executions(job_id)?)
            .await
        {
            warn!(job_id, error = %e, "checking pending results");
        }
        if let Err(e) = self.check_for_completed_executions(&job, &store.get_executions(job_id)?) {
            warn!(job_id, error = %e, "checking completed executions");
        }
        Ok(())
    }

    /// Returns true if the job was stopped.
    fn check_for_failed_executions(
        &self,
        job: &Job,
        executions: &[Execution],
    ) -> OrchestratorResult<bool> {
        use ExecutionStateType::*;

        let concurrency = job.deal.concurrency() as usize;
        let min_bids = job.deal.min_bids as usize;
        let accepted_bids = count(executions, |s| s.has_accepted_ask_for_bid());
        let published = count(executions, |s| {
            matches!(s, ResultProposed | ResultAccepted | Completed)
        });
        let live = count(executions, |s| !s.is_discarded());

        // Branch order matters: an unmet bidding quota wins over a
        // published result.
        let min_executions = if accepted_bids == 0 || accepted_bids < min_bids {
            min_bids.max(concurrency)
        } else if published > 0 {
            1
        } else {
            concurrency
        };
        if live >= min_executions {
            return Ok(false);
        }

        let shortfall = min_executions - live;
        let mut retry_error = None;
        if self.inner.params.retry_strategy.should_retry(&job.id) {
            match self.inner.params.selector.select_nodes(job, shortfall, shortfall) {
                Ok(nodes) => {
                    self.inner.params.metrics.increment_counter(JOB_RETRIES_TOTAL, &[]);
                    let asked = self.launch_executions(job, &nodes)?;
                    info!(job_id = %job.id, live, min_executions, asked, "retrying job");
                    return Ok(false);
                }
                Err(e) => retry_error = Some(e),
            }
        }

        let last_failure = executions
            .iter()
            .filter(|e| e.state().is_discarded() && !e.compute_state.message.is_empty())
            .max_by_key(|e| e.updated_at)
            .map(|e| e.compute_state.message.clone());
        let mut message = last_failure
            .unwrap_or_else(|| format!("{live} live executions, {min_executions} required"));
        if let Some(e) = retry_error {
            message = format!("{message}; retry failed: {e}");
        }
        self.stop_job(job, JobState::Error, &message)?;
        Ok(true)
    }

    fn check_for_pending_bids(&self, job: &Job, executions: &[Execution]) -> OrchestratorResult<()> {
        let concurrency = job.deal.concurrency() as usize;
        let mut active = count(executions, |s| s.is_active());
        let pending: Vec<&Execution> = executions
            .iter()
            .filter(|e| e.state() == ExecutionStateType::AskForBidAccepted)
            .collect();
        if pending.is_empty() || pending.len() + active < job.deal.min_bids as usize {
            return Ok(());
        }

        for execution in pending {
            if active < concurrency {
                let request = UpdateExecutionRequest::new(&execution.id)
                    .expect_states(&[ExecutionStateType::AskForBidAccepted])
                    .compute_state(ExecutionStateType::BidAccepted, "bid accepted")
                    .desired_state(ExecutionDesiredState::Running, "");
                if let Some(updated) = self.update_execution(request)? {
                    active += 1;
                    debug!(execution_id = %updated.id, node_id = %updated.node_id, "bid accepted");
                    self.notify(&updated, Notification::BidAccepted, "bid accepted");
                }
            } else {
                let reason = "job concurrency already satisfied";
                let request = UpdateExecutionRequest::new(&execution.id)
                    .expect_states(&[ExecutionStateType::AskForBidAccepted])
                    .compute_state(ExecutionStateType::BidRejected, reason)
                    .desired_state(ExecutionDesiredState::Stopped, reason);
                if let Some(updated) = self.update_execution(request)? {
                    debug!(execution_id = %updated.id, node_id = %updated.node_id, "bid rejected");
                    self.notify(&updated, Notification::BidRejected, reason);
                }
            }
        }
        Ok(())
    }

    async fn check_for_pending_results(
        &self,
        job: &Job,
        executions: &[Execution],
    ) -> OrchestratorResult<()> {
        use ExecutionStateType::*;

        let proposed: Vec<Execution> = executions
            .iter()
            .filter(|e| e.state() == ResultProposed)
            .cloned()
            .collect();
        if proposed.is_empty() {
            return Ok(());
        }
        // A lost peer must not stall the job: once nothing live is still
        // running, verify what has been proposed.
        let still_running = executions.iter().any(|e| {
            let state = e.state();
            !state.is_discarded() && !matches!(state, ResultProposed | ResultAccepted | Completed)
        });
        if proposed.len() < job.deal.concurrency() as usize && still_running {
            return Ok(());
        }

        let verifier = &self.inner.params.verifier;
        let results = verifier
            .verify(job, &proposed)
            .await
            .map_err(|e| OrchestratorError::Verification(format!("{}: {e}", verifier.name())))?;

        let mut accepted = 0;
        for result in results {
            let (state, notification, message) = if result.verified {
                (ResultAccepted, Notification::ResultAccepted, "result accepted")
            } else {
                (ResultRejected, Notification::ResultRejected, "result rejected by verifier")
            };
            let mut request = UpdateExecutionRequest::new(&result.execution_id)
                .expect_states(&[ResultProposed])
                .compute_state(state, message);
            if !result.verified {
                request = request.desired_state(ExecutionDesiredState::Stopped, message);
            }
            if let Some(updated) = self.update_execution(request)? {
                if result.verified {
                    accepted += 1;
                }
                self.notify(&updated, notification, message);
            }
        }

        if accepted == 0 {
            info!(job_id = %job.id, "no result verified, re-evaluating job");
            self.schedule_transition(&job.id);
        }
        Ok(())
    }

    fn check_for_completed_executions(
        &self,
        job: &Job,
        executions: &[Execution],
    ) -> OrchestratorResult<()> {
        if count(executions, |s| s == ExecutionStateType::ResultAccepted) > 0 {
            return Ok(());
        }
        let completed = count(executions, |s| s == ExecutionStateType::Completed);
        if completed == 0 {
            return Ok(());
        }

        let state = if completed >= job.deal.confidence as usize {
            JobState::Completed
        } else {
            JobState::CompletedPartially
        };
        self.stop_job(job, state, &format!("{completed} executions completed"))?;
        Ok(())
    }

    /// Move the job to a terminal `state` and cancel its live executions.
    /// Returns false if the job was already terminal.
    fn stop_job(&self, job: &Job, state: JobState, message: &str) -> OrchestratorResult<bool> {
        let store = &self.inner.params.store;
        let request = UpdateJobStateRequest::new(&job.id, state, message)
            .expect_states(&JobState::non_terminal());
        match store.update_job_state(request) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let metrics = &self.inner.params.metrics;
        match state {
            JobState::Error => {
                metrics.increment_counter(JOBS_FAILED_TOTAL, &[]);
                warn!(job_id = %job.id, message, "job failed");
            }
            JobState::Completed | JobState::CompletedPartially => {
                let label = state.to_string();
                metrics.increment_counter(JOBS_COMPLETED_TOTAL, &[("state", label.as_str())]);
                info!(job_id = %job.id, state = %state, "job completed");
            }
            _ => {}
        }

        for execution in store.get_executions(&job.id)? {
            if execution.is_terminal() {
                continue;
            }
            let request = UpdateExecutionRequest::new(&execution.id)
                .expect_states(&ExecutionStateType::non_terminal())
                .compute_state(ExecutionStateType::Cancelled, message)
                .desired_state(ExecutionDesiredState::Stopped, message);
            if let Some(updated) = self.update_execution(request)? {
                self.notify(&updated, Notification::Cancel, message);
            }
        }
        Ok(true)
    }

    /// Record one execution per node, then ask each node for a bid.
    fn launch_executions(&self, job: &Job, nodes: &[NodeRank]) -> OrchestratorResult<usize> {
        let mut executions = Vec::with_capacity(nodes.len());
        for rank in nodes {
            let execution = Execution::new(job, &rank.node.id);
            self.inner.params.store.create_execution(&execution)?;
            executions.push(execution);
        }
        for execution in &executions {
            self.notify(execution, Notification::AskForBid, "");
        }
        Ok(executions.len())
    }

    /// Apply a conditional update; a stale update yields `None`.
    fn update_execution(
        &self,
        request: UpdateExecutionRequest,
    ) -> OrchestratorResult<Option<Execution>> {
        match self.inner.params.store.update_execution_state(request) {
            Ok(execution) => Ok(Some(execution)),
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "stale execution update ignored");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn schedule_transition(&self, job_id: &str) {
        let scheduler = self.clone();
        let job_id = job_id.to_string();
        self.inner.params.tasks.spawn(async move {
            scheduler.transition_job_state(&job_id).await;
        });
    }

    fn notify(&self, execution: &Execution, kind: Notification, justification: &str) {
        let scheduler = self.clone();
        let execution = execution.clone();
        let justification = justification.to_string();
        self.inner.params.tasks.spawn(async move {
            let execution_id = execution.id.clone();
            let node_id = execution.node_id.clone();
            let timeout = scheduler.inner.params.notification_timeout;

            let sent = scheduler.send(execution, kind, justification);
            let message = match tokio::time::timeout(timeout, sent).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("{} to {node_id} failed: {e}", kind.as_str()),
                Err(_) => format!("{} to {node_id} timed out after {timeout:?}", kind.as_str()),
            };
            warn!(%execution_id, %node_id, %message, "notification failed");
            scheduler.handle_execution_failure(&execution_id, &message).await;
        });
    }

    async fn send(
        &self,
        execution: Execution,
        kind: Notification,
        justification: String,
    ) -> CoreResult<()> {
        let compute = &self.inner.params.compute;
        let routing = RoutingMetadata::new(&self.inner.params.node_id, &execution.node_id);
        let request = || ExecutionRequest {
            routing: routing.clone(),
            execution_id: execution.id.clone(),
            justification: justification.clone(),
        };

        match kind {
            Notification::AskForBid => {
                let request = AskForBidRequest {
                    routing: routing.clone(),
                    wait_for_approval: !execution.job.direct_run,
                    execution: execution.clone(),
                };
                compute.ask_for_bid(request).await.map(|_| ())
            }
            Notification::BidAccepted => compute.bid_accepted(request()).await.map(|_| ()),
            Notification::BidRejected => compute.bid_rejected(request()).await.map(|_| ()),
            Notification::ResultAccepted => compute.result_accepted(request()).await.map(|_| ()),
            Notification::ResultRejected => compute.result_rejected(request()).await.map(|_| ()),
            Notification::Cancel => compute.cancel_execution(request()).await.map(|_| ()),
        }
    }

    /// Apply a callback's update and re-evaluate the job if it took effect.
    async fn apply_callback(
        &self,
        kind: &'static str,
        metadata: &ExecutionMetadata,
        request: UpdateExecutionRequest,
    ) {
        match self.update_execution(request) {
            Ok(Some(execution)) => self.transition_job_state(&execution.job_id).await,
            Ok(None) => debug!(
                execution_id = %metadata.execution_id,
                kind,
                "callback does not match the execution state"
            ),
            Err(e) => warn!(
                execution_id = %metadata.execution_id,
                kind,
                error = %e,
                "failed to apply callback"
            ),
        }
    }
}

fn count(executions: &[Execution], predicate: impl Fn(ExecutionStateType) -> bool) -> usize {
    executions.iter().filter(|e| predicate(e.state())).count()
}

#[async_trait]
impl Callback for Scheduler {
    async fn on_bid_complete(&self, result: BidResult) {
        let metadata = &result.execution_metadata;
        let mut request = UpdateExecutionRequest::new(&metadata.execution_id)
            .expect_states(&[ExecutionStateType::New]);
        request = if result.accepted && result.direct_run {
            // Already running on the node; skip the approval round trip.
            request
                .compute_state(ExecutionStateType::BidAccepted, result.reason.clone())
                .desired_state(ExecutionDesiredState::Running, "bid accepted")
        } else if result.accepted {
            request.compute_state(ExecutionStateType::AskForBidAccepted, result.reason.clone())
        } else {
            request
                .compute_state(ExecutionStateType::AskForBidRejected, result.reason.clone())
                .desired_state(ExecutionDesiredState::Stopped, result.reason.clone())
        };
        self.apply_callback("bid", metadata, request).await;
    }

    async fn on_run_complete(&self, result: RunResult) {
        let metadata = &result.execution_metadata;
        let request = UpdateExecutionRequest::new(&metadata.execution_id)
            .expect_states(&[ExecutionStateType::BidAccepted])
            .compute_state(ExecutionStateType::ResultProposed, "")
            .run_output(result.output.clone());
        self.apply_callback("run", metadata, request).await;
    }

    async fn on_publish_complete(&self, result: PublishResult) {
        let metadata = &result.execution_metadata;
        let request = UpdateExecutionRequest::new(&metadata.execution_id)
            .expect_states(&[ExecutionStateType::ResultAccepted])
            .compute_state(ExecutionStateType::Completed, "")
            .desired_state(ExecutionDesiredState::Stopped, "")
            .published_result(result.published.clone());
        self.apply_callback("publish", metadata, request).await;
    }

    async fn on_cancel_complete(&self, result: CancelResult) {
        let metadata = &result.execution_metadata;
        let request = UpdateExecutionRequest::new(&metadata.execution_id)
            .expect_states(&ExecutionStateType::non_terminal())
            .compute_state(ExecutionStateType::Cancelled, "cancelled by compute node")
            .desired_state(ExecutionDesiredState::Stopped, "");
        self.apply_callback("cancel", metadata, request).await;
    }

    async fn on_compute_failure(&self, failure: ComputeFailure) {
        self.handle_execution_failure(&failure.execution_metadata.execution_id, &failure.message)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use jobgrid_core::protocol::{AskForBidResponse, ExecutionResponse};
    use jobgrid_core::sync::MutexExt;
    use jobgrid_core::{
        CoreError, Deal, InMemoryMetrics, PublishedResult, RunCommandResult, Task,
    };
    use jobgrid_state::{ExecutionStore, InMemoryStore};

    use crate::discovery::InMemoryNodeDiscoverer;
    use crate::ranking::tests::{FixedRanker, node};
    use crate::ranking::{ChainRanker, PreviousExecutionsNodeRanker};
    use crate::retry::{BudgetRetryStrategy, FixedRetryStrategy};
    use crate::verifier::{NoopVerifier, VerificationResult};

    /// Records every request; nodes in `unreachable` fail.
    #[derive(Default)]
    struct RecordingEndpoint {
        calls: Mutex<Vec<(&'static str, String, String)>>,
        /// `wait_for_approval` of every ask for bid, in order.
        approvals: Mutex<Vec<bool>>,
        unreachable: HashSet<String>,
    }

    impl RecordingEndpoint {
        fn record(&self, kind: &'static str, routing: &RoutingMetadata, execution_id: &str) -> CoreResult<()> {
            let node = routing.target_peer_id.clone();
            if self.unreachable.contains(&node) {
                return Err(CoreError::NodeUnreachable(node));
            }
            self.calls.lock_unpoisoned().push((kind, node, execution_id.to_string()));
            Ok(())
        }

        fn nodes_called(&self, kind: &str) -> Vec<String> {
            let mut nodes: Vec<String> = self
                .calls
                .lock_unpoisoned()
                .iter()
                .filter(|(k, _, _)| *k == kind)
                .map(|(_, node, _)| node.clone())
                .collect();
            nodes.sort();
            nodes
        }

        fn reply(&self, kind: &'static str, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
            self.record(kind, &request.routing, &request.execution_id)?;
            Ok(ExecutionResponse {
                execution_metadata: ExecutionMetadata {
                    execution_id: request.execution_id,
                    job_id: String::new(),
                },
            })
        }
    }

    #[async_trait]
    impl ComputeEndpoint for RecordingEndpoint {
        async fn ask_for_bid(&self, request: AskForBidRequest) -> CoreResult<AskForBidResponse> {
            self.approvals.lock_unpoisoned().push(request.wait_for_approval);
            self.record("ask_for_bid", &request.routing, &request.execution.id)?;
            Ok(AskForBidResponse {
                execution_metadata: ExecutionMetadata::of(&request.execution),
            })
        }
        async fn bid_accepted(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
            self.reply("bid_accepted", request)
        }
        async fn bid_rejected(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
            self.reply("bid_rejected", request)
        }
        async fn result_accepted(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
            self.reply("result_accepted", request)
        }
        async fn result_rejected(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
            self.reply("result_rejected", request)
        }
        async fn cancel_execution(&self, request: ExecutionRequest) -> CoreResult<ExecutionResponse> {
            self.reply("cancel_execution", request)
        }
    }

    struct RejectAll;

    #[async_trait]
    impl Verifier for RejectAll {
        fn name(&self) -> &'static str {
            "reject-all"
        }

        async fn verify(
            &self,
            _job: &Job,
            proposed: &[Execution],
        ) -> OrchestratorResult<Vec<VerificationResult>> {
            Ok(proposed
                .iter()
                .map(|e| VerificationResult {
                    execution_id: e.id.clone(),
                    verified: false,
                })
                .collect())
        }
    }

    struct Harness {
        scheduler: Scheduler,
        store: Arc<InMemoryStore>,
        endpoint: Arc<RecordingEndpoint>,
        metrics: Arc<InMemoryMetrics>,
    }

    struct Setup {
        ranks: Vec<(&'static str, i32)>,
        retry: Arc<dyn RetryStrategy>,
        verifier: Arc<dyn Verifier>,
        over_ask_factor: u32,
        unreachable: Vec<&'static str>,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                ranks: vec![("a", 10), ("b", 5)],
                retry: Arc::new(FixedRetryStrategy::new(true)),
                verifier: Arc::new(NoopVerifier),
                over_ask_factor: 3,
                unreachable: Vec::new(),
            }
        }
    }

    fn harness(setup: Setup) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let endpoint = Arc::new(RecordingEndpoint {
            unreachable: setup.unreachable.iter().map(|n| n.to_string()).collect(),
            ..RecordingEndpoint::default()
        });

        let nodes = setup.ranks.iter().map(|(id, _)| node(id)).collect();
        let ranker = ChainRanker::default()
            .with(Arc::new(FixedRanker::new("fixed", &setup.ranks)))
            .with(Arc::new(PreviousExecutionsNodeRanker::new(store.clone())));
        let selector = NodeSelector::new(Arc::new(InMemoryNodeDiscoverer::new(nodes)), Arc::new(ranker));

        let scheduler = Scheduler::new(SchedulerParams {
            node_id: "orchestrator".to_string(),
            store: store.clone(),
            selector,
            compute: endpoint.clone(),
            retry_strategy: setup.retry,
            verifier: setup.verifier,
            over_ask_factor: setup.over_ask_factor,
            notification_timeout: Duration::from_secs(5),
            tasks: BackgroundTasks::new(),
            metrics: metrics.clone(),
        });
        Harness {
            scheduler,
            store,
            endpoint,
            metrics,
        }
    }

    fn job(concurrency: u32, min_bids: u32) -> Job {
        Job::new("j", Task::new("noop")).with_deal(Deal::new(concurrency, min_bids))
    }

    impl Harness {
        async fn settle(&self) {
            self.scheduler.wait_for_notifications().await;
        }

        fn execution_on(&self, job_id: &str, node_id: &str) -> Execution {
            self.store
                .get_executions(job_id)
                .unwrap()
                .into_iter()
                .rev()
                .find(|e| e.node_id == node_id)
                .unwrap()
        }

        fn state_on(&self, job_id: &str, node_id: &str) -> ExecutionStateType {
            self.execution_on(job_id, node_id).state()
        }

        fn job_state(&self, job_id: &str) -> JobState {
            self.store.get_job(job_id).unwrap().state
        }

        async fn bid(&self, job_id: &str, node_id: &str, accepted: bool, reason: &str) {
            self.bid_result(job_id, node_id, accepted, false, reason).await;
        }

        async fn bid_result(
            &self,
            job_id: &str,
            node_id: &str,
            accepted: bool,
            direct_run: bool,
            reason: &str,
        ) {
            let execution = self.execution_on(job_id, node_id);
            self.scheduler
                .on_bid_complete(BidResult {
                    routing: RoutingMetadata::new(node_id, "orchestrator"),
                    execution_metadata: ExecutionMetadata::of(&execution),
                    accepted,
                    reason: reason.to_string(),
                    direct_run,
                })
                .await;
            self.settle().await;
        }

        async fn publish_complete(&self, job_id: &str, node_id: &str) {
            let execution = self.execution_on(job_id, node_id);
            self.scheduler
                .on_publish_complete(PublishResult {
                    routing: RoutingMetadata::new(node_id, "orchestrator"),
                    execution_metadata: ExecutionMetadata::of(&execution),
                    published: PublishedResult {
                        kind: "noop".to_string(),
                        uri: format!("noop://{node_id}"),
                    },
                })
                .await;
            self.settle().await;
        }

        async fn run_complete(&self, job_id: &str, node_id: &str) {
            let execution = self.execution_on(job_id, node_id);
            self.scheduler
                .on_run_complete(RunResult {
                    routing: RoutingMetadata::new(node_id, "orchestrator"),
                    execution_metadata: ExecutionMetadata::of(&execution),
                    output: RunCommandResult {
                        stdout: "done".to_string(),
                        ..RunCommandResult::default()
                    },
                })
                .await;
            self.settle().await;
        }

        async fn fail(&self, job_id: &str, node_id: &str, message: &str) {
            let execution = self.execution_on(job_id, node_id);
            self.scheduler
                .on_compute_failure(ComputeFailure {
                    routing: RoutingMetadata::new(node_id, "orchestrator"),
                    execution_metadata: ExecutionMetadata::of(&execution),
                    message: message.to_string(),
                })
                .await;
            self.settle().await;
        }
    }

    #[tokio::test]
    async fn accepts_first_bid_without_waiting_for_silent_node() {
        let h = harness(Setup::default());
        let job = job(1, 1);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;

        assert_eq!(h.job_state(&job_id), JobState::InProgress);
        assert_eq!(h.endpoint.nodes_called("ask_for_bid"), vec!["a", "b"]);

        // b never answers.
        h.bid(&job_id, "a", true, "").await;
        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::BidAccepted);
        assert_eq!(h.state_on(&job_id, "b"), ExecutionStateType::New);
        assert_eq!(h.endpoint.nodes_called("bid_accepted"), vec!["a"]);

        h.run_complete(&job_id, "a").await;
        let a = h.execution_on(&job_id, "a");
        assert_eq!(a.state(), ExecutionStateType::ResultAccepted);
        assert_eq!(a.run_output.map(|o| o.stdout).as_deref(), Some("done"));
        assert_eq!(h.endpoint.nodes_called("result_accepted"), vec!["a"]);
        assert_eq!(*h.endpoint.approvals.lock_unpoisoned(), vec![true, true]);

        h.publish_complete(&job_id, "a").await;

        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::Completed);
        assert_eq!(h.job_state(&job_id), JobState::Completed);
        assert_eq!(h.state_on(&job_id, "b"), ExecutionStateType::Cancelled);
        assert_eq!(h.endpoint.nodes_called("cancel_execution"), vec!["b"]);
        assert_eq!(h.metrics.counter(JOBS_COMPLETED_TOTAL, &[("state", "Completed")]), 1);
    }

    #[tokio::test]
    async fn retry_disabled_fails_job_exactly_once() {
        let h = harness(Setup {
            retry: Arc::new(FixedRetryStrategy::new(false)),
            ..Setup::default()
        });
        let job = job(1, 1);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;

        h.bid(&job_id, "a", false, "node busy").await;
        assert_eq!(h.job_state(&job_id), JobState::InProgress);

        h.bid(&job_id, "b", false, "node busy").await;
        let stopped = h.store.get_job(&job_id).unwrap();
        assert_eq!(stopped.state, JobState::Error);
        assert_eq!(stopped.state_message, "node busy");
        assert_eq!(h.metrics.counter_total(JOBS_FAILED_TOTAL), 1);

        h.scheduler.transition_job_state(&job_id).await;
        h.settle().await;
        assert_eq!(h.store.get_job(&job_id).unwrap().version, stopped.version);
        assert_eq!(h.store.get_executions(&job_id).unwrap().len(), 2);
        assert_eq!(h.metrics.counter_total(JOB_RETRIES_TOTAL), 0);
        assert_eq!(h.metrics.counter_total(JOBS_FAILED_TOTAL), 1);
    }

    #[tokio::test]
    async fn failed_execution_is_retried_on_a_fresh_node() {
        let h = harness(Setup {
            ranks: vec![("a", 10), ("b", 5), ("c", 1)],
            over_ask_factor: 1,
            ..Setup::default()
        });
        let job = job(1, 1);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;
        assert_eq!(h.endpoint.nodes_called("ask_for_bid"), vec!["a"]);

        h.fail(&job_id, "a", "engine crashed").await;
        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::Failed);
        assert_eq!(h.endpoint.nodes_called("ask_for_bid"), vec!["a", "b"]);
        assert_eq!(h.state_on(&job_id, "b"), ExecutionStateType::New);
        assert_eq!(h.metrics.counter_total(JOB_RETRIES_TOTAL), 1);
        assert_eq!(h.job_state(&job_id), JobState::InProgress);
    }

    #[tokio::test]
    async fn retry_budget_bounds_replacements() {
        let h = harness(Setup {
            ranks: vec![("a", 10), ("b", 5), ("c", 1)],
            retry: Arc::new(BudgetRetryStrategy::new(1)),
            over_ask_factor: 1,
            ..Setup::default()
        });
        let job = job(1, 1);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;

        h.fail(&job_id, "a", "first failure").await;
        h.fail(&job_id, "b", "second failure").await;

        let stopped = h.store.get_job(&job_id).unwrap();
        assert_eq!(stopped.state, JobState::Error);
        assert!(stopped.state_message.ends_with("failure"));
        assert_eq!(h.endpoint.nodes_called("ask_for_bid"), vec!["a", "b"]);
        assert_eq!(h.metrics.counter_total(JOB_RETRIES_TOTAL), 1);
    }

    #[tokio::test]
    async fn not_enough_nodes_stops_the_job() {
        let h = harness(Setup::default());
        let job = job(3, 0);
        let job_id = job.id.clone();

        let err = h.scheduler.start_job(job).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NotEnoughNodes { requested: 3, available: 2 }
        ));
        assert_eq!(h.job_state(&job_id), JobState::Error);
        assert!(h.store.get_executions(&job_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn bids_are_rationed_by_concurrency() {
        let h = harness(Setup {
            ranks: vec![("a", 10), ("b", 5), ("c", 1)],
            over_ask_factor: 1,
            ..Setup::default()
        });
        let job = job(1, 2);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;
        assert_eq!(h.endpoint.nodes_called("ask_for_bid"), vec!["a", "b"]);

        h.bid(&job_id, "a", true, "").await;
        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::AskForBidAccepted);

        h.bid(&job_id, "b", true, "").await;
        let mut states = vec![h.state_on(&job_id, "a"), h.state_on(&job_id, "b")];
        states.sort();
        assert_eq!(states, vec![ExecutionStateType::BidAccepted, ExecutionStateType::BidRejected]);
        assert_eq!(h.endpoint.nodes_called("bid_accepted").len(), 1);
        assert_eq!(h.endpoint.nodes_called("bid_rejected").len(), 1);
    }

    #[tokio::test]
    async fn unreachable_node_fails_its_execution() {
        let h = harness(Setup {
            unreachable: vec!["b"],
            ..Setup::default()
        });
        let job = job(1, 1);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;

        let b = h.execution_on(&job_id, "b");
        assert_eq!(b.state(), ExecutionStateType::Failed);
        assert!(b.compute_state.message.contains("unreachable"));
        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::New);
        assert_eq!(h.job_state(&job_id), JobState::InProgress);
    }

    #[tokio::test]
    async fn cancel_stops_job_and_executions() {
        let h = harness(Setup::default());
        let job = job(1, 1);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;

        h.scheduler.cancel_job(&job_id, "user request").await.unwrap();
        h.settle().await;
        let cancelled = h.store.get_job(&job_id).unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert_eq!(cancelled.state_message, "user request");
        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::Cancelled);
        assert_eq!(h.endpoint.nodes_called("cancel_execution"), vec!["a", "b"]);

        // A late bid does not revive the execution.
        h.bid(&job_id, "a", true, "").await;
        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::Cancelled);

        let err = h.scheduler.cancel_job(&job_id, "again").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::JobAlreadyTerminal(_)));
        let err = h.scheduler.cancel_job("j-missing", "").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn rejected_results_fail_the_job_without_retry() {
        let h = harness(Setup {
            retry: Arc::new(FixedRetryStrategy::new(false)),
            verifier: Arc::new(RejectAll),
            over_ask_factor: 1,
            ..Setup::default()
        });
        let job = job(1, 1);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;

        h.bid(&job_id, "a", true, "").await;
        h.run_complete(&job_id, "a").await;

        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::ResultRejected);
        assert_eq!(h.endpoint.nodes_called("result_rejected"), vec!["a"]);
        assert_eq!(h.job_state(&job_id), JobState::Error);
    }

    #[tokio::test]
    async fn duplicate_callbacks_are_ignored() {
        let h = harness(Setup::default());
        let job = job(1, 1);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;

        h.bid(&job_id, "a", true, "").await;
        let before = h.execution_on(&job_id, "a");
        h.bid(&job_id, "a", true, "").await;
        assert_eq!(h.execution_on(&job_id, "a").version, before.version);
        assert_eq!(h.endpoint.nodes_called("bid_accepted"), vec!["a"]);
    }

    #[tokio::test]
    async fn direct_run_bid_is_recorded_as_running() {
        let h = harness(Setup::default());
        let job = job(1, 1).with_direct_run();
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;

        // No over-asking, and the node is told not to wait.
        assert_eq!(h.endpoint.nodes_called("ask_for_bid"), vec!["a"]);
        assert_eq!(*h.endpoint.approvals.lock_unpoisoned(), vec![false]);

        h.bid_result(&job_id, "a", true, true, "").await;
        let a = h.execution_on(&job_id, "a");
        assert_eq!(a.state(), ExecutionStateType::BidAccepted);
        assert_eq!(a.desired_state.state, ExecutionDesiredState::Running);
        assert!(h.endpoint.nodes_called("bid_accepted").is_empty());

        h.run_complete(&job_id, "a").await;
        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::ResultAccepted);
        h.publish_complete(&job_id, "a").await;
        assert_eq!(h.job_state(&job_id), JobState::Completed);
        assert_eq!(h.metrics.counter_total(JOBS_FAILED_TOTAL), 0);
    }

    #[tokio::test]
    async fn fewer_completions_than_confidence_complete_partially() {
        let h = harness(Setup {
            over_ask_factor: 1,
            ..Setup::default()
        });
        let job = Job::new("j", Task::new("noop")).with_deal(Deal::new(1, 1).with_confidence(2));
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;

        h.bid(&job_id, "a", true, "").await;
        h.run_complete(&job_id, "a").await;
        h.publish_complete(&job_id, "a").await;

        let stopped = h.store.get_job(&job_id).unwrap();
        assert_eq!(stopped.state, JobState::CompletedPartially);
        assert_eq!(stopped.state_message, "1 executions completed");
        assert_eq!(
            h.metrics.counter(JOBS_COMPLETED_TOTAL, &[("state", "CompletedPartially")]),
            1
        );
        assert_eq!(h.metrics.counter(JOBS_COMPLETED_TOTAL, &[("state", "Completed")]), 0);
    }

    #[tokio::test]
    async fn lone_result_is_verified_once_its_peer_fails() {
        let h = harness(Setup {
            ranks: vec![("a", 10), ("b", 5), ("c", 1)],
            over_ask_factor: 1,
            ..Setup::default()
        });
        let job = job(2, 0);
        let job_id = job.id.clone();
        h.scheduler.start_job(job).await.unwrap();
        h.settle().await;
        assert_eq!(h.endpoint.nodes_called("ask_for_bid"), vec!["a", "b"]);

        h.bid(&job_id, "a", true, "").await;
        h.bid(&job_id, "b", true, "").await;
        h.run_complete(&job_id, "a").await;
        // b is still running, so a waits for it.
        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::ResultProposed);
        assert!(h.endpoint.nodes_called("result_accepted").is_empty());

        h.fail(&job_id, "b", "engine crashed").await;
        assert_eq!(h.state_on(&job_id, "b"), ExecutionStateType::Failed);
        assert_eq!(h.state_on(&job_id, "a"), ExecutionStateType::ResultAccepted);
        assert_eq!(h.endpoint.nodes_called("result_accepted"), vec!["a"]);
        assert_eq!(h.metrics.counter_total(JOB_RETRIES_TOTAL), 0);
        assert_eq!(h.job_state(&job_id), JobState::InProgress);
    }
}
