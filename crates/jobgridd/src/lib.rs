//! jobgridd: wiring for the JobGrid devstack.
//!
//! The binary in `main.rs` is a thin CLI over [`devstack::Devstack`]; the
//! library target exists so integration tests can build the same stack.

pub mod devstack;

pub use devstack::{Devstack, ExecutionReport, JobReport};
