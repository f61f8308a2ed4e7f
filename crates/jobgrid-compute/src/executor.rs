//! Execution delegates.
//!
//! [`Executor`] is what the buffer hands admitted executions to.
//! [`BaseExecutor`] is the shipped implementation: it looks up the job's
//! [`Engine`], runs it under a timeout and a cancellation token, and later
//! publishes results through a [`Publisher`]. Every outcome is persisted
//! in the node's store with a conditional update and reported through the
//! orchestrator [`Callback`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobgrid_core::protocol::{
    Callback, CancelResult, ComputeFailure, ExecutionMetadata, PublishResult, RoutingMetadata,
    RunResult,
};
use jobgrid_core::{
    Execution, ExecutionDesiredState, ExecutionStateType, PublishedResult, RunCommandResult,
};
use jobgrid_state::{ExecutionStore, StateError, UpdateExecutionRequest};

use crate::error::{ComputeError, ComputeResult};

/// Runs, publishes and cancels executions on behalf of the buffer.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run an admitted execution to completion. `timeout` bounds the run;
    /// `cancel` interrupts it.
    async fn run(
        &self,
        execution: Execution,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> ComputeResult<()>;

    /// Publish the results of an execution whose result was accepted.
    async fn publish(&self, execution_id: &str) -> ComputeResult<()>;

    /// Mark an execution cancelled. Interrupting a running engine is done
    /// through the token passed to `run`.
    async fn cancel(&self, execution_id: &str) -> ComputeResult<()>;
}

/// Runs a task of one engine kind, matched on [`Engine::name`].
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, execution: &Execution) -> ComputeResult<RunCommandResult>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn publish(&self, execution: &Execution) -> ComputeResult<PublishedResult>;
}

/// Engine that succeeds after an optional delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEngine {
    delay: Duration,
}

impl NoopEngine {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Engine for NoopEngine {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn run(&self, execution: &Execution) -> ComputeResult<RunCommandResult> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(RunCommandResult {
            stdout: format!("noop run of {}", execution.id),
            ..RunCommandResult::default()
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn publish(&self, execution: &Execution) -> ComputeResult<PublishedResult> {
        Ok(PublishedResult {
            kind: "noop".to_string(),
            uri: format!("noop://{}/{}", execution.job_id, execution.id),
        })
    }
}

enum RunOutcome {
    Finished(ComputeResult<RunCommandResult>),
    TimedOut(Duration),
    Cancelled,
}

/// Dispatches to the engine and publisher named by the job's task.
pub struct BaseExecutor {
    node_id: String,
    requester_node_id: String,
    store: Arc<dyn ExecutionStore>,
    callback: Arc<dyn Callback>,
    engines: HashMap<String, Arc<dyn Engine>>,
    publishers: HashMap<String, Arc<dyn Publisher>>,
}

impl BaseExecutor {
    pub fn new(
        node_id: &str,
        requester_node_id: &str,
        store: Arc<dyn ExecutionStore>,
        callback: Arc<dyn Callback>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            requester_node_id: requester_node_id.to_string(),
            store,
            callback,
            engines: HashMap::new(),
            publishers: HashMap::new(),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engines.insert(engine.name().to_string(), engine);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers
            .insert(publisher.name().to_string(), publisher);
        self
    }

    fn routing(&self) -> RoutingMetadata {
        RoutingMetadata::new(&self.node_id, &self.requester_node_id)
    }

    /// Persist a failure and report it. A conflict means another path
    /// already finished the execution, so nothing is reported.
    async fn fail(&self, execution: &Execution, expected: &[ExecutionStateType], message: String) {
        let update = UpdateExecutionRequest::new(&execution.id)
            .expect_states(expected)
            .compute_state(ExecutionStateType::Failed, message.clone())
            .desired_state(ExecutionDesiredState::Stopped, message.clone());
        match self.store.update_execution_state(update) {
            Ok(_) => {
                self.callback
                    .on_compute_failure(ComputeFailure {
                        routing: self.routing(),
                        execution_metadata: ExecutionMetadata::of(execution),
                        message,
                    })
                    .await;
            }
            Err(e) => debug!(execution_id = %execution.id, error = %e, "failure not recorded"),
        }
    }

    /// A store write on the run or publish path failed. A conflict means
    /// cancellation or a timeout got there first; any other error leaves
    /// the execution stuck, so it is reported as a failure.
    async fn write_failed(&self, execution: &Execution, err: StateError) -> ComputeError {
        if err.is_conflict() {
            debug!(execution_id = %execution.id, error = %err, "execution moved on");
        } else {
            warn!(execution_id = %execution.id, error = %err, "execution state not persisted");
            self.callback
                .on_compute_failure(ComputeFailure {
                    routing: self.routing(),
                    execution_metadata: ExecutionMetadata::of(execution),
                    message: format!("execution state not persisted: {err}"),
                })
                .await;
        }
        err.into()
    }

    async fn report_cancelled(
        &self,
        execution: &Execution,
        expected: &[ExecutionStateType],
    ) -> ComputeResult<()> {
        let update = UpdateExecutionRequest::new(&execution.id)
            .expect_states(expected)
            .compute_state(ExecutionStateType::Cancelled, "execution cancelled")
            .desired_state(ExecutionDesiredState::Stopped, "execution cancelled");
        self.store.update_execution_state(update)?;
        self.callback
            .on_cancel_complete(CancelResult {
                routing: self.routing(),
                execution_metadata: ExecutionMetadata::of(execution),
            })
            .await;
        Ok(())
    }
}

#[async_trait]
impl Executor for BaseExecutor {
    async fn run(
        &self,
        execution: Execution,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> ComputeResult<()> {
        let Some(engine) = self.engines.get(&execution.job.task.engine.kind).cloned() else {
            let message = format!("engine {} is not installed", execution.job.task.engine.kind);
            self.fail(&execution, &[ExecutionStateType::BidAccepted], message.clone())
                .await;
            return Err(ComputeError::Engine(message));
        };

        let started = match self.store.update_execution_state(
            UpdateExecutionRequest::new(&execution.id)
                .expect_states(&[ExecutionStateType::BidAccepted])
                .compute_state(ExecutionStateType::Running, "")
                .allocated_resources(execution.allocated_resources.clone()),
        ) {
            Ok(started) => started,
            Err(e) => return Err(self.write_failed(&execution, e).await),
        };
        info!(execution_id = %started.id, engine = engine.name(), ?timeout, "execution started");

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => RunOutcome::Cancelled,
            _ = deadline => RunOutcome::TimedOut(timeout.unwrap_or_default()),
            result = engine.run(&started) => RunOutcome::Finished(result),
        };

        match outcome {
            RunOutcome::Finished(Ok(output)) => {
                if let Err(e) = self.store.update_execution_state(
                    UpdateExecutionRequest::new(&started.id)
                        .expect_states(&[ExecutionStateType::Running])
                        .compute_state(ExecutionStateType::ResultProposed, "")
                        .run_output(output.clone()),
                ) {
                    return Err(self.write_failed(&started, e).await);
                }
                info!(execution_id = %started.id, exit_code = output.exit_code, "execution finished");
                self.callback
                    .on_run_complete(RunResult {
                        routing: self.routing(),
                        execution_metadata: ExecutionMetadata::of(&started),
                        output,
                    })
                    .await;
                Ok(())
            }
            RunOutcome::Finished(Err(e)) => {
                warn!(execution_id = %started.id, error = %e, "execution failed");
                self.fail(&started, &[ExecutionStateType::Running], e.to_string())
                    .await;
                Err(e)
            }
            RunOutcome::TimedOut(timeout) => {
                let err = ComputeError::Timeout {
                    execution_id: started.id.clone(),
                    timeout,
                };
                warn!(execution_id = %started.id, ?timeout, "execution timed out");
                self.fail(&started, &[ExecutionStateType::Running], err.to_string())
                    .await;
                Err(err)
            }
            RunOutcome::Cancelled => {
                if let Err(e) = self
                    .report_cancelled(&started, &[ExecutionStateType::Running])
                    .await
                {
                    debug!(execution_id = %started.id, error = %e, "cancellation already recorded");
                }
                Ok(())
            }
        }
    }

    async fn publish(&self, execution_id: &str) -> ComputeResult<()> {
        let execution = self.store.get_execution(execution_id)?;
        let publisher_kind = if execution.job.task.publisher.is_empty() {
            "noop"
        } else {
            execution.job.task.publisher.as_str()
        };
        let Some(publisher) = self.publishers.get(publisher_kind).cloned() else {
            let message = format!("publisher {publisher_kind} is not installed");
            self.fail(&execution, &[ExecutionStateType::ResultAccepted], message.clone())
                .await;
            return Err(ComputeError::Publisher(message));
        };

        match publisher.publish(&execution).await {
            Ok(published) => {
                if let Err(e) = self.store.update_execution_state(
                    UpdateExecutionRequest::new(execution_id)
                        .expect_states(&[ExecutionStateType::ResultAccepted])
                        .compute_state(ExecutionStateType::Completed, "")
                        .desired_state(ExecutionDesiredState::Stopped, "completed")
                        .published_result(published.clone()),
                ) {
                    return Err(self.write_failed(&execution, e).await);
                }
                info!(%execution_id, uri = %published.uri, "results published");
                self.callback
                    .on_publish_complete(PublishResult {
                        routing: self.routing(),
                        execution_metadata: ExecutionMetadata::of(&execution),
                        published,
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(%execution_id, error = %e, "publishing failed");
                self.fail(&execution, &[ExecutionStateType::ResultAccepted], e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn cancel(&self, execution_id: &str) -> ComputeResult<()> {
        let execution = self.store.get_execution(execution_id)?;
        self.report_cancelled(&execution, &ExecutionStateType::non_terminal())
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use jobgrid_core::protocol::BidResult;
    use jobgrid_core::sync::MutexExt;
    use jobgrid_core::{Job, Task};
    use jobgrid_state::InMemoryStore;

    /// Records every callback as `"<kind>:<execution_id>"`.
    #[derive(Default)]
    pub(crate) struct RecordingCallback {
        pub events: Mutex<Vec<String>>,
        pub bids: Mutex<Vec<BidResult>>,
    }

    impl RecordingCallback {
        pub fn events(&self) -> Vec<String> {
            self.events.lock_unpoisoned().clone()
        }

        fn push(&self, kind: &str, meta: &ExecutionMetadata) {
            self.events
                .lock_unpoisoned()
                .push(format!("{kind}:{}", meta.execution_id));
        }
    }

    #[async_trait]
    impl Callback for RecordingCallback {
        async fn on_bid_complete(&self, result: BidResult) {
            self.push("bid", &result.execution_metadata);
            self.bids.lock_unpoisoned().push(result);
        }
        async fn on_run_complete(&self, result: RunResult) {
            self.push("run", &result.execution_metadata);
        }
        async fn on_publish_complete(&self, result: PublishResult) {
            self.push("publish", &result.execution_metadata);
        }
        async fn on_cancel_complete(&self, result: CancelResult) {
            self.push("cancel", &result.execution_metadata);
        }
        async fn on_compute_failure(&self, failure: ComputeFailure) {
            self.push("failure", &failure.execution_metadata);
        }
    }

    fn setup(delay: Duration) -> (BaseExecutor, InMemoryStore, Arc<RecordingCallback>) {
        let store = InMemoryStore::new();
        let callback = Arc::new(RecordingCallback::default());
        let executor = BaseExecutor::new(
            "compute-0",
            "orchestrator-0",
            Arc::new(store.clone()),
            callback.clone(),
        )
        .with_engine(Arc::new(NoopEngine::new(delay)))
        .with_publisher(Arc::new(NoopPublisher));
        (executor, store, callback)
    }

    fn accepted_execution(store: &InMemoryStore, task: Task) -> Execution {
        let exec = Execution::new(&Job::new("j", task), "compute-0");
        store.create_execution(&exec).unwrap();
        store
            .update_execution_state(
                UpdateExecutionRequest::new(&exec.id)
                    .compute_state(ExecutionStateType::BidAccepted, ""),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn run_then_publish() {
        let (executor, store, callback) = setup(Duration::ZERO);
        let exec = accepted_execution(&store, Task::new("noop"));

        executor
            .run(exec.clone(), None, CancellationToken::new())
            .await
            .unwrap();
        let stored = store.get_execution(&exec.id).unwrap();
        assert_eq!(stored.state(), ExecutionStateType::ResultProposed);
        assert!(stored.run_output.is_some());

        store
            .update_execution_state(
                UpdateExecutionRequest::new(&exec.id)
                    .compute_state(ExecutionStateType::ResultAccepted, ""),
            )
            .unwrap();
        executor.publish(&exec.id).await.unwrap();

        let stored = store.get_execution(&exec.id).unwrap();
        assert_eq!(stored.state(), ExecutionStateType::Completed);
        assert_eq!(stored.published_result.unwrap().kind, "noop");
        assert_eq!(
            callback.events(),
            vec![format!("run:{}", exec.id), format!("publish:{}", exec.id)]
        );
    }

    #[tokio::test]
    async fn timeout_is_a_failure() {
        let (executor, store, callback) = setup(Duration::from_secs(30));
        let exec = accepted_execution(&store, Task::new("noop"));

        let err = executor
            .run(exec.clone(), Some(Duration::from_millis(20)), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Timeout { .. }));
        assert_eq!(store.get_execution(&exec.id).unwrap().state(), ExecutionStateType::Failed);
        assert_eq!(callback.events(), vec![format!("failure:{}", exec.id)]);
    }

    #[tokio::test]
    async fn cancel_token_is_a_cancellation() {
        let (executor, store, callback) = setup(Duration::from_secs(30));
        let exec = accepted_execution(&store, Task::new("noop"));
        let token = CancellationToken::new();
        token.cancel();

        executor.run(exec.clone(), None, token).await.unwrap();
        assert_eq!(
            store.get_execution(&exec.id).unwrap().state(),
            ExecutionStateType::Cancelled
        );
        assert_eq!(callback.events(), vec![format!("cancel:{}", exec.id)]);
    }

    #[tokio::test]
    async fn unknown_engine_fails() {
        let (executor, store, callback) = setup(Duration::ZERO);
        let exec = accepted_execution(&store, Task::new("docker"));

        assert!(executor.run(exec.clone(), None, CancellationToken::new()).await.is_err());
        assert_eq!(store.get_execution(&exec.id).unwrap().state(), ExecutionStateType::Failed);
        assert_eq!(callback.events(), vec![format!("failure:{}", exec.id)]);
    }

    /// Delegates to an in-memory store but rejects every write that moves
    /// an execution into `broken`.
    struct BrokenWrites {
        inner: InMemoryStore,
        broken: ExecutionStateType,
    }

    impl ExecutionStore for BrokenWrites {
        fn create_execution(&self, execution: &Execution) -> jobgrid_state::StateResult<()> {
            self.inner.create_execution(execution)
        }
        fn get_execution(&self, execution_id: &str) -> jobgrid_state::StateResult<Execution> {
            self.inner.get_execution(execution_id)
        }
        fn get_executions(&self, job_id: &str) -> jobgrid_state::StateResult<Vec<Execution>> {
            self.inner.get_executions(job_id)
        }
        fn get_live_executions(&self) -> jobgrid_state::StateResult<Vec<Execution>> {
            self.inner.get_live_executions()
        }
        fn update_execution_state(
            &self,
            request: UpdateExecutionRequest,
        ) -> jobgrid_state::StateResult<Execution> {
            let target = request.new_values.compute_state.as_ref().map(|s| s.state);
            if target == Some(self.broken) {
                return Err(StateError::Write("disk full".to_string()));
            }
            self.inner.update_execution_state(request)
        }
    }

    fn setup_broken(
        broken: ExecutionStateType,
    ) -> (BaseExecutor, InMemoryStore, Arc<RecordingCallback>) {
        let store = InMemoryStore::new();
        let callback = Arc::new(RecordingCallback::default());
        let executor = BaseExecutor::new(
            "compute-0",
            "orchestrator-0",
            Arc::new(BrokenWrites { inner: store.clone(), broken }),
            callback.clone(),
        )
        .with_engine(Arc::new(NoopEngine::default()))
        .with_publisher(Arc::new(NoopPublisher));
        (executor, store, callback)
    }

    #[tokio::test]
    async fn unpersisted_start_is_reported() {
        let (executor, store, callback) = setup_broken(ExecutionStateType::Running);
        let exec = accepted_execution(&store, Task::new("noop"));

        let err = executor
            .run(exec.clone(), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::State(StateError::Write(_))));
        assert_eq!(callback.events(), vec![format!("failure:{}", exec.id)]);
    }

    #[tokio::test]
    async fn unpersisted_result_is_reported() {
        let (executor, store, callback) = setup_broken(ExecutionStateType::ResultProposed);
        let exec = accepted_execution(&store, Task::new("noop"));

        assert!(executor.run(exec.clone(), None, CancellationToken::new()).await.is_err());
        assert_eq!(store.get_execution(&exec.id).unwrap().state(), ExecutionStateType::Running);
        assert_eq!(callback.events(), vec![format!("failure:{}", exec.id)]);
    }

    #[tokio::test]
    async fn conflicting_start_is_not_reported() {
        let (executor, store, callback) = setup(Duration::ZERO);
        let exec = accepted_execution(&store, Task::new("noop"));
        executor.cancel(&exec.id).await.unwrap();

        let err = executor
            .run(exec.clone(), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(callback.events(), vec![format!("cancel:{}", exec.id)]);
    }

    #[tokio::test]
    async fn cancel_reports_once() {
        let (executor, store, callback) = setup(Duration::ZERO);
        let exec = accepted_execution(&store, Task::new("noop"));

        executor.cancel(&exec.id).await.unwrap();
        assert!(executor.cancel(&exec.id).await.is_err());
        assert_eq!(callback.events(), vec![format!("cancel:{}", exec.id)]);
    }
}
