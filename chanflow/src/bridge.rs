//! Push-to-pull bridging through a single-slot handoff.
//!
//! A [`Handoff`] lets a push-style producer feed a pull-style downstream
//! read. The driver forks a background pump that steps the displaced upstream
//! executor and forwards each emission and the terminal outcome into the
//! slot; an undo finalizer signals the pump to stop when the enclosing scope
//! closes and waits for it to close the upstream it carries.

use crate::exec::{ChannelExecutor, Step};
use crate::outcome::{Cause, Outcome, Payload};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};

/// One message through the handoff.
#[derive(Clone, Debug)]
pub enum Signal {
    /// The upstream emitted a value.
    Emitted(Payload),
    /// The upstream terminated.
    Done(Outcome),
}

/// A single-slot rendezvous between one producer and one consumer.
#[derive(Clone)]
pub struct Handoff {
    tx: mpsc::Sender<Signal>,
    rx: Arc<Mutex<mpsc::Receiver<Signal>>>,
}

impl Default for Handoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Handoff {
    /// Creates an empty handoff.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Offers a signal, waiting until the slot is free.
    ///
    /// Returns false if the consumer side is gone.
    pub async fn offer(&self, signal: Signal) -> bool {
        self.tx.send(signal).await.is_ok()
    }

    /// Takes the next signal, waiting until one is offered.
    ///
    /// A dropped producer reads as an interrupted outcome.
    pub async fn take(&self) -> Signal {
        match self.rx.lock().await.recv().await {
            Some(signal) => signal,
            None => Signal::Done(Outcome::interrupted()),
        }
    }
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff").finish()
    }
}

/// Drives `upstream` to completion, forwarding everything into `handoff`.
///
/// The pump awaits the upstream's own suspensions, so the displaced executor
/// is fully self-driven once forked. When `stop` flips, or the consumer side
/// goes away, the pump closes the upstream it carries so its finalizers still
/// run; a failure from that close is the pump's return value.
pub(crate) async fn pump(
    mut upstream: ChannelExecutor,
    handoff: Handoff,
    mut stop: watch::Receiver<bool>,
) -> Result<(), Cause> {
    let stopped = loop {
        if *stop.borrow() {
            break true;
        }
        match upstream.step() {
            Step::Produced(value) => {
                trace!("bridge pump forwarding emission");
                tokio::select! {
                    delivered = handoff.offer(Signal::Emitted(value)) => {
                        if !delivered {
                            debug!("bridge consumer gone; stopping pump");
                            break true;
                        }
                    }
                    _ = stop.changed() => break true,
                }
            }
            Step::Finished(outcome) => {
                tokio::select! {
                    _ = handoff.offer(Signal::Done(outcome)) => {}
                    _ = stop.changed() => {}
                }
                break false;
            }
            Step::Suspend(task) => {
                if task.is_uninterruptible() {
                    let result = task.await;
                    upstream.resume(result);
                } else {
                    tokio::select! {
                        result = task => upstream.resume(result),
                        _ = stop.changed() => break true,
                    }
                }
            }
            Step::NeedsUpstream => {
                debug!("bridged upstream has no source of its own; stopping");
                tokio::select! {
                    _ = handoff.offer(Signal::Done(Outcome::Failure(Cause::die(
                        "bridged upstream requested input with no upstream attached",
                    )))) => {}
                    _ = stop.changed() => {}
                }
                break true;
            }
        }
    };
    if stopped {
        debug!("bridge pump stopping; closing the displaced upstream");
        if let Some(task) = upstream.close(&Outcome::interrupted()) {
            task.await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_then_take() {
        let handoff = Handoff::new();
        assert!(handoff.offer(Signal::Emitted(Payload::new(5_i32))).await);
        match handoff.take().await {
            Signal::Emitted(value) => assert_eq!(value.downcast_ref::<i32>(), Some(&5)),
            Signal::Done(outcome) => panic!("unexpected done: {outcome:?}"),
        }
    }

    #[tokio::test]
    async fn test_signals_preserve_order() {
        let handoff = Handoff::new();
        let producer = handoff.clone();
        let feeder = tokio::spawn(async move {
            for i in 0..3_i32 {
                producer.offer(Signal::Emitted(Payload::new(i))).await;
            }
            producer.offer(Signal::Done(Outcome::unit())).await;
        });
        let mut seen = Vec::new();
        loop {
            match handoff.take().await {
                Signal::Emitted(value) => {
                    seen.extend(value.downcast_ref::<i32>().copied());
                }
                Signal::Done(outcome) => {
                    assert!(outcome.is_success());
                    break;
                }
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
        let _ = feeder.await;
    }

    #[tokio::test]
    async fn test_slot_backpressure() {
        let handoff = Handoff::new();
        assert!(handoff.offer(Signal::Emitted(Payload::unit())).await);
        // Second offer must wait until the first is taken.
        let producer = handoff.clone();
        let pending = tokio::spawn(async move {
            producer.offer(Signal::Emitted(Payload::new(2_i32))).await
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        let _ = handoff.take().await;
        assert!(pending.await.unwrap_or(false));
    }
}
