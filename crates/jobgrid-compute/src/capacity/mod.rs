//! Capacity accounting for a compute node.
//!
//! Two trackers split node pressure in two: [`ResourceCapacityTracker`]
//! holds what is actually running and is the admission gate;
//! [`EnqueuedUsageTracker`] only observes what is waiting in the buffer.

pub mod calculator;
pub mod enqueued;
pub mod tracker;

pub use calculator::{ChainedUsageCalculator, DefaultsUsageCalculator, UsageCalculator};
pub use enqueued::EnqueuedUsageTracker;
pub use tracker::ResourceCapacityTracker;
