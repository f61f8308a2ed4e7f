//! jobgrid-compute: the compute node side of JobGrid.
//!
//! An ask-for-bid flows through the node like this:
//!
//! ```text
//! ComputeNode::ask_for_bid
//!   └─ Bidder::run_bidding          semantic chain → usage calculator → resource chain
//!        └─ (bid accepted by the orchestrator)
//!             └─ ExecutorBuffer::run   priority queue, capacity-gated dispatch
//!                  └─ BaseExecutor::run  Engine, then Publisher on result acceptance
//! ```
//!
//! [`capacity::ResourceCapacityTracker`] is the only gate for starting work;
//! nothing launches an execution without a successful
//! `add_if_has_capacity`.

pub mod bidder;
pub mod bidstrategy;
pub mod buffer;
pub mod capacity;
pub mod endpoint;
pub mod error;
pub mod executor;

pub use bidder::{BidRequest, Bidder, BidderParams};
pub use buffer::{ExecutorBuffer, ExecutorBufferParams};
pub use endpoint::{ComputeNode, ComputeNodeParams};
pub use error::{ComputeError, ComputeResult};
pub use executor::{BaseExecutor, Engine, Executor, NoopEngine, NoopPublisher, Publisher};
