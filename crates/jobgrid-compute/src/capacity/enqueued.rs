//! Queued usage tracker.

use std::sync::Mutex;

use jobgrid_core::sync::MutexExt;
use jobgrid_core::{CoreResult, Resources};

/// Sum of resources reserved by executions waiting in the buffer. Not a
/// limit; it makes queue pressure visible to bid strategies and node info.
#[derive(Debug, Default)]
pub struct EnqueuedUsageTracker {
    used: Mutex<Resources>,
}

impl EnqueuedUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, usage: &Resources) {
        let mut used = self.used.lock_unpoisoned();
        *used = used.add(usage);
    }

    pub fn remove(&self, usage: &Resources) -> CoreResult<()> {
        let mut used = self.used.lock_unpoisoned();
        *used = used.checked_sub(usage)?;
        Ok(())
    }

    pub fn get_used_capacity(&self) -> Resources {
        self.used.lock_unpoisoned().clone()
    }
}
