//! Executor buffer: admission control between "bid accepted" and
//! "running".
//!
//! Executions wait in a priority queue (higher job priority first, FIFO
//! within a priority) and are dispatched whenever running capacity allows.
//! Dispatch makes a single bounded pass over the queue and skips entries
//! that do not fit, so a large job never blocks smaller ones queued behind
//! it. The price is that a large job can starve while smaller work keeps
//! arriving.
//!
//! Lock order: buffer state, then the capacity trackers. Neither lock is
//! held across an await or while calling the delegate.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobgrid_core::metrics::{
    BUFFER_DEQUEUED_TOTAL, BUFFER_ENQUEUED_TOTAL, BUFFER_QUEUED, BUFFER_REJECTED_TOTAL,
    BUFFER_RUNNING, EXECUTIONS_TIMED_OUT_TOTAL,
};
use jobgrid_core::sync::MutexExt;
use jobgrid_core::{BackgroundTasks, Execution, SharedMetrics};

use crate::capacity::{EnqueuedUsageTracker, ResourceCapacityTracker};
use crate::error::{ComputeError, ComputeResult};
use crate::executor::Executor;

/// Queue order: priority descending, then arrival.
type QueueKey = (Reverse<i32>, u64);

struct RunningExecution {
    execution: Execution,
    cancel: CancellationToken,
}

#[derive(Default)]
struct BufferState {
    queue: BTreeMap<QueueKey, Execution>,
    queued: HashMap<String, QueueKey>,
    running: HashMap<String, RunningExecution>,
    next_seq: u64,
}

pub struct ExecutorBufferParams {
    /// Used as the `node` label on the buffer gauges.
    pub node_id: String,
    /// Capacity held by running executions. Dispatch allocates from it.
    pub running_capacity: Arc<ResourceCapacityTracker>,
    /// Usage of executions waiting in the queue.
    pub enqueued_capacity: Arc<EnqueuedUsageTracker>,
    /// Runs, publishes and cancels the executions the buffer dispatches.
    pub delegate: Arc<dyn Executor>,
    /// Applied to jobs that set no timeout of their own.
    pub default_timeout: Option<Duration>,
    pub tasks: BackgroundTasks,
    pub metrics: SharedMetrics,
}

struct BufferInner {
    node_id: String,
    running_capacity: Arc<ResourceCapacityTracker>,
    enqueued_capacity: Arc<EnqueuedUsageTracker>,
    delegate: Arc<dyn Executor>,
    default_timeout: Option<Duration>,
    tasks: BackgroundTasks,
    metrics: SharedMetrics,
    state: Mutex<BufferState>,
}

/// Cloning shares the same queue.
#[derive(Clone)]
pub struct ExecutorBuffer {
    inner: Arc<BufferInner>,
}

impl ExecutorBuffer {
    /// Create a new buffer with an empty queue.
    pub fn new(params: ExecutorBufferParams) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                node_id: params.node_id,
                running_capacity: params.running_capacity,
                enqueued_capacity: params.enqueued_capacity,
                delegate: params.delegate,
                default_timeout: params.default_timeout,
                tasks: params.tasks,
                metrics: params.metrics,
                state: Mutex::new(BufferState::default()),
            }),
        }
    }

    /// Queue an execution and dispatch whatever fits. Returns once the
    /// execution is queued; the run itself happens on a background task.
    ///
    /// Fails if the execution could never fit on this node, or if it is
    /// already queued or running.
    pub fn run(&self, execution: Execution) -> ComputeResult<()> {
        let inner = &self.inner;
        let usage = execution.allocated_resources.clone();
        let mut state = inner.state.lock_unpoisoned();

        if !inner.running_capacity.is_within_limits(&usage) {
            inner.metrics.increment_counter(
                BUFFER_REJECTED_TOTAL,
                &[("node", inner.node_id.as_str()), ("reason", "exceeds_capacity")],
            );
            return Err(ComputeError::ExceedsTotalCapacity {
                execution_id: execution.id.clone(),
                requested: usage.to_string(),
                capacity: inner.running_capacity.get_max_capacity().to_string(),
            });
        }
        if state.queued.contains_key(&execution.id) || state.running.contains_key(&execution.id) {
            inner.metrics.increment_counter(
                BUFFER_REJECTED_TOTAL,
                &[("node", inner.node_id.as_str()), ("reason", "duplicate")],
            );
            return Err(ComputeError::DuplicateExecution(execution.id.clone()));
        }

        inner.enqueued_capacity.add(&usage);
        let key = (Reverse(execution.priority()), state.next_seq);
        state.next_seq += 1;
        state.queued.insert(execution.id.clone(), key);
        debug!(
            execution_id = %execution.id,
            priority = execution.priority(),
            usage = %usage,
            "execution enqueued"
        );
        state.queue.insert(key, execution);
        inner
            .metrics
            .increment_counter(BUFFER_ENQUEUED_TOTAL, &[("node", inner.node_id.as_str())]);

        self.deque(&mut state);
        Ok(())
    }

    /// One pass over the queue in priority order, starting every execution
    /// that fits. Entries that do not fit keep their place.
    fn deque(&self, state: &mut BufferState) {
        let inner = &self.inner;
        let candidates: Vec<QueueKey> = state.queue.keys().copied().collect();

        for key in candidates {
            let Some(usage) = state.queue.get(&key).map(|e| e.allocated_resources.clone()) else {
                continue;
            };
            let Some(allocated) = inner.running_capacity.add_if_has_capacity(&usage) else {
                continue;
            };
            let Some(mut execution) = state.queue.remove(&key) else {
                continue;
            };
            state.queued.remove(&execution.id);
            if let Err(e) = inner.enqueued_capacity.remove(&usage) {
                error!(execution_id = %execution.id, error = %e, "enqueued usage out of sync");
            }
            execution.allocated_resources = allocated;

            let cancel = CancellationToken::new();
            state.running.insert(
                execution.id.clone(),
                RunningExecution {
                    execution: execution.clone(),
                    cancel: cancel.clone(),
                },
            );
            info!(
                execution_id = %execution.id,
                allocated = %execution.allocated_resources,
                "execution dequeued"
            );
            inner
                .metrics
                .increment_counter(BUFFER_DEQUEUED_TOTAL, &[("node", inner.node_id.as_str())]);

            let buffer = self.clone();
            inner
                .tasks
                .spawn(async move { buffer.do_run(execution, cancel).await });
        }

        self.record_gauges(state);
    }

    async fn do_run(&self, execution: Execution, cancel: CancellationToken) {
        let inner = &self.inner;
        let timeout = if execution.job.is_long_running() {
            None
        } else {
            execution.job.execution_timeout().or(inner.default_timeout)
        };

        match inner
            .delegate
            .run(execution.clone(), timeout, cancel)
            .await
        {
            Ok(()) => debug!(execution_id = %execution.id, "execution run returned"),
            Err(e @ ComputeError::Timeout { .. }) => {
                inner
                    .metrics
                    .increment_counter(EXECUTIONS_TIMED_OUT_TOTAL, &[("node", inner.node_id.as_str())]);
                warn!(execution_id = %execution.id, error = %e, "execution timed out");
            }
            Err(e) => warn!(execution_id = %execution.id, error = %e, "execution run failed"),
        }

        let mut state = inner.state.lock_unpoisoned();
        state.running.remove(&execution.id);
        if let Err(e) = inner.running_capacity.remove(&execution.allocated_resources) {
            error!(execution_id = %execution.id, error = %e, "running capacity out of sync");
        }
        self.deque(&mut state);
    }

    /// Cancel a queued or running execution. Queued executions leave the
    /// queue immediately; running ones are interrupted through their
    /// token. The delegate records the cancellation in the background.
    pub fn cancel(&self, execution: &Execution) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock_unpoisoned();
            if let Some(key) = state.queued.remove(&execution.id) {
                if let Some(queued) = state.queue.remove(&key) {
                    if let Err(e) = inner.enqueued_capacity.remove(&queued.allocated_resources) {
                        error!(execution_id = %execution.id, error = %e, "enqueued usage out of sync");
                    }
                }
                self.record_gauges(&state);
            } else if let Some(running) = state.running.get(&execution.id) {
                running.cancel.cancel();
            }
        }

        let buffer = self.clone();
        let execution_id = execution.id.clone();
        inner.tasks.spawn(async move {
            match buffer.inner.delegate.cancel(&execution_id).await {
                Ok(()) => {
                    let mut state = buffer.inner.state.lock_unpoisoned();
                    state.running.remove(&execution_id);
                    buffer.record_gauges(&state);
                    info!(%execution_id, "execution cancelled");
                }
                Err(e) => debug!(%execution_id, error = %e, "cancel not applied"),
            }
        });
    }

    /// Snapshot of the executions dispatched to the delegate and not yet
    /// finished.
    pub fn running_executions(&self) -> Vec<Execution> {
        self.inner
            .state
            .lock_unpoisoned()
            .running
            .values()
            .map(|r| r.execution.clone())
            .collect()
    }

    /// Executions waiting for running capacity.
    pub fn enqueued_executions_count(&self) -> usize {
        self.inner.state.lock_unpoisoned().queue.len()
    }

    fn record_gauges(&self, state: &BufferState) {
        let inner = &self.inner;
        inner.metrics.set_gauge(
            BUFFER_RUNNING,
            &[("node", inner.node_id.as_str())],
            state.running.len() as f64,
        );
        inner.metrics.set_gauge(
            BUFFER_QUEUED,
            &[("node", inner.node_id.as_str())],
            state.queue.len() as f64,
        );
    }
}
