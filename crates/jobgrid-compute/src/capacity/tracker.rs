//! Running capacity tracker.

use std::sync::Mutex;

use tracing::debug;

use jobgrid_core::sync::MutexExt;
use jobgrid_core::{CoreResult, Gpu, Resources};

/// Tracks resources committed to running executions against a fixed
/// maximum. All reads and writes go through one mutex; it is a leaf lock
/// and is never held while calling out.
///
/// `remove` trusts the caller: releasing the same allocation twice is not
/// detected unless it would underflow.
#[derive(Debug)]
pub struct ResourceCapacityTracker {
    max: Resources,
    used: Mutex<Resources>,
}

impl ResourceCapacityTracker {
    pub fn new(max: Resources) -> Self {
        Self {
            max,
            used: Mutex::new(Resources::default()),
        }
    }

    /// Whether `usage` could ever fit on this node.
    pub fn is_within_limits(&self, usage: &Resources) -> bool {
        usage.less_than_eq(&self.max)
    }

    /// Commit `usage` if it fits next to what is already used.
    ///
    /// Returns the resources actually allocated. When the node knows its
    /// GPUs individually, the result names the chosen devices, lowest free
    /// index first. Returns `None` without side effects if anything does
    /// not fit.
    pub fn add_if_has_capacity(&self, usage: &Resources) -> Option<Resources> {
        let mut used = self.used.lock_unpoisoned();
        if !used.add(usage).less_than_eq(&self.max) {
            return None;
        }

        let allocated = if usage.gpu > 0 && !self.max.gpus.is_empty() {
            let free: Vec<Gpu> = self
                .max
                .gpus
                .iter()
                .filter(|g| !used.gpus.iter().any(|u| u.index == g.index))
                .take(usage.gpu as usize)
                .cloned()
                .collect();
            if (free.len() as u64) < usage.gpu {
                return None;
            }
            usage.clone().with_gpus(free)
        } else {
            usage.clone()
        };

        *used = used.add(&allocated);
        debug!(allocated = %allocated, "capacity reserved");
        Some(allocated)
    }

    /// Release a previous allocation.
    pub fn remove(&self, usage: &Resources) -> CoreResult<()> {
        let mut used = self.used.lock_unpoisoned();
        *used = used.checked_sub(usage)?;
        debug!(released = %usage, "capacity released");
        Ok(())
    }

    pub fn get_available_capacity(&self) -> Resources {
        let used = self.used.lock_unpoisoned();
        self.max.checked_sub(&used).unwrap_or_default()
    }

    pub fn get_max_capacity(&self) -> Resources {
        self.max.clone()
    }

    pub fn get_used_capacity(&self) -> Resources {
        self.used.lock_unpoisoned().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgrid_core::GpuVendor;

    fn gpu(index: u64) -> Gpu {
        Gpu {
            index,
            name: format!("gpu-{index}"),
            vendor: GpuVendor::Nvidia,
            memory: 16 << 30,
        }
    }

    #[test]
    fn add_and_remove() {
        let tracker = ResourceCapacityTracker::new(Resources::new(2.0, 1000, 0, 0));
        let half = Resources::new(1.0, 500, 0, 0);

        assert!(tracker.add_if_has_capacity(&half).is_some());
        assert!(tracker.add_if_has_capacity(&half).is_some());
        assert!(tracker.add_if_has_capacity(&half).is_none());
        assert!(tracker.get_available_capacity().is_zero());

        tracker.remove(&half).unwrap();
        assert_eq!(tracker.get_available_capacity(), half);
    }

    #[test]
    fn failed_add_has_no_side_effects() {
        let tracker = ResourceCapacityTracker::new(Resources::new(1.0, 100, 0, 0));
        tracker
            .add_if_has_capacity(&Resources::new(0.5, 0, 0, 0))
            .unwrap();
        let before = tracker.get_used_capacity();
        assert!(
            tracker
                .add_if_has_capacity(&Resources::new(0.5, 200, 0, 0))
                .is_none()
        );
        assert_eq!(tracker.get_used_capacity(), before);
    }

    #[test]
    fn within_limits_ignores_usage() {
        let tracker = ResourceCapacityTracker::new(Resources::new(1.0, 0, 0, 0));
        tracker
            .add_if_has_capacity(&Resources::new(1.0, 0, 0, 0))
            .unwrap();
        assert!(tracker.is_within_limits(&Resources::new(1.0, 0, 0, 0)));
        assert!(!tracker.is_within_limits(&Resources::new(1.5, 0, 0, 0)));
    }

    #[test]
    fn over_release_is_an_error() {
        let tracker = ResourceCapacityTracker::new(Resources::new(1.0, 0, 0, 0));
        assert!(tracker.remove(&Resources::new(0.5, 0, 0, 0)).is_err());
        assert!(tracker.get_used_capacity().is_zero());
    }

    #[test]
    fn gpus_are_chosen_lowest_free_index_first() {
        let max = Resources::new(8.0, 0, 0, 0).with_gpus(vec![gpu(0), gpu(1), gpu(2)]);
        let tracker = ResourceCapacityTracker::new(max);
        let one_gpu = Resources::new(1.0, 0, 0, 1);

        let first = tracker.add_if_has_capacity(&one_gpu).unwrap();
        let second = tracker.add_if_has_capacity(&one_gpu).unwrap();
        assert_eq!(first.gpus[0].index, 0);
        assert_eq!(second.gpus[0].index, 1);

        tracker.remove(&first).unwrap();
        let two = tracker
            .add_if_has_capacity(&Resources::new(1.0, 0, 0, 2))
            .unwrap();
        let indices: Vec<u64> = two.gpus.iter().map(|g| g.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(tracker.add_if_has_capacity(&one_gpu).is_none());
    }

    #[test]
    fn never_oversubscribed_under_contention() {
        use std::sync::Arc;
        use std::thread;

        let max = Resources::new(4.0, 4096, 0, 0);
        let tracker = Arc::new(ResourceCapacityTracker::new(max.clone()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                let max = max.clone();
                thread::spawn(move || {
                    let usage = Resources::new(0.5 + (i % 3) as f64 * 0.5, 256 * (i + 1), 0, 0);
                    for _ in 0..200 {
                        if let Some(allocated) = tracker.add_if_has_capacity(&usage) {
                            assert!(tracker.get_used_capacity().less_than_eq(&max));
                            tracker.remove(&allocated).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(tracker.get_used_capacity().is_zero());
    }
}
