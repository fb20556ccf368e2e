//! Minimal host schedulers for driving an executor inside tests.

use crate::exec::{ChannelExecutor, Step};
use crate::outcome::{Outcome, Payload};
use std::collections::VecDeque;

/// Drives the executor to completion, collecting every emission.
///
/// # Panics
///
/// Panics if the channel requests upstream input; use [`drive_with_input`]
/// for channels with an open upstream.
pub async fn drive_to_end(exec: &mut ChannelExecutor) -> (Vec<Payload>, Outcome) {
    let mut produced = Vec::new();
    loop {
        match exec.step() {
            Step::Produced(value) => produced.push(value),
            Step::Finished(outcome) => return (produced, outcome),
            Step::Suspend(task) => {
                let result = task.await;
                exec.resume(result);
            }
            Step::NeedsUpstream => {
                panic!("channel requested upstream input with none attached")
            }
        }
    }
}

/// Drives the executor to completion, answering upstream reads from `inputs`
/// and with a unit outcome once they run out.
pub async fn drive_with_input(
    exec: &mut ChannelExecutor,
    inputs: Vec<Payload>,
) -> (Vec<Payload>, Outcome) {
    let mut inputs: VecDeque<Payload> = inputs.into();
    let mut produced = Vec::new();
    loop {
        match exec.step() {
            Step::Produced(value) => produced.push(value),
            Step::Finished(outcome) => return (produced, outcome),
            Step::Suspend(task) => {
                let result = task.await;
                exec.resume(result);
            }
            Step::NeedsUpstream => match inputs.pop_front() {
                Some(value) => exec.feed_more(value),
                None => exec.feed_done(Outcome::unit()),
            },
        }
    }
}

/// Installs a test-friendly tracing subscriber, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chanflow=trace")),
        )
        .with_test_writer()
        .try_init();
}
