//! Test support: drivers that play the host scheduler role and fixtures for
//! observing finalizer order.

mod harness;
mod recorder;

pub use harness::{drive_to_end, drive_with_input, init_tracing};
pub use recorder::Recorder;
