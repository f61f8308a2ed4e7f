//! Tracked background tasks.
//!
//! Every fire-and-forget spawn (bidding, outbound notifications, buffered
//! runs) goes through a [`BackgroundTasks`] handle so that shutdown and
//! tests can wait for in-flight work deterministically instead of
//! sleeping. Spawned tasks are detached from the caller: dropping or
//! cancelling the code that spawned them does not cancel them.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a detached, tracked task on the current runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait until no tracked task remains, including tasks spawned by
    /// tracked tasks while waiting.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
