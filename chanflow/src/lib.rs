//! # Chanflow
//!
//! A resumable, trampolined execution engine for channel pipelines.
//!
//! Chanflow interprets a declarative [`node::ChannelNode`] tree one step at a
//! time. Each call to [`exec::ChannelExecutor::step`] returns a single
//! [`exec::Step`], handing control back to the host scheduler:
//!
//! - **Step protocol**: emissions, terminal outcomes, suspensions and
//!   upstream reads all surface as explicit values, never as blocking calls
//! - **Guaranteed cleanup**: finalizers run exactly once, strictly LIFO, on
//!   success, failure and cancellation alike
//! - **Sub-pipeline concatenation**: per-emission child channels with
//!   pluggable pull policies, fairness yields and early close
//! - **Multi-level reads**: piped executors form a chain that is walked
//!   iteratively, so pipeline depth never grows the call stack
//! - **Bridging**: a single-slot handoff decouples push-style producers from
//!   the pull-driven interpreter
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chanflow::prelude::*;
//!
//! let node = ChannelNode::emit_value(1_i32)
//!     .zip_right(ChannelNode::emit_value(2_i32));
//! let mut exec = ChannelExecutor::new(node);
//!
//! loop {
//!     match exec.step() {
//!         Step::Produced(value) => println!("{value:?}"),
//!         Step::Finished(outcome) => break,
//!         Step::Suspend(task) => {
//!             let result = task.await;
//!             exec.resume(result);
//!         }
//!         Step::NeedsUpstream => exec.feed_done(Outcome::unit()),
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bridge;
pub mod errors;
pub mod exec;
pub mod node;
pub mod outcome;
pub mod policy;
pub mod task;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{Handoff, Signal};
    pub use crate::errors::EngineError;
    pub use crate::exec::{ChannelExecutor, Step};
    pub use crate::node::ChannelNode;
    pub use crate::outcome::{Cause, Outcome, Payload};
    pub use crate::policy::{ChildDecision, PullPolicy, PullRequest};
    pub use crate::task::{Task, TaskResult};
}
