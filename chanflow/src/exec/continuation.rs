//! Continuation and finalizer frames.
//!
//! The stack is vector-backed and exclusively owned by the driving executor;
//! frames are unwound exactly once, strictly LIFO, identically on success,
//! failure and cancellation.

use crate::bridge::Handoff;
use crate::node::{FailFn, FinalizerFn, MoreFn};
use crate::outcome::{Cause, Outcome, Payload};
use crate::task::Task;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One frame of the continuation stack.
pub(crate) enum ContinuationFrame {
    /// On-success / on-failure handlers installed by a `Fold` node.
    Fold {
        /// Continuation on success.
        on_success: MoreFn,
        /// Continuation on failure.
        on_failure: FailFn,
    },
    /// A cleanup action installed by `AttachCleanup`, `Bracket`, or one of
    /// the rewiring nodes.
    Cleanup(Finalizer),
}

impl fmt::Debug for ContinuationFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fold { .. } => write!(f, "Fold"),
            Self::Cleanup(finalizer) => write!(f, "Cleanup({finalizer:?})"),
        }
    }
}

/// The action a cleanup frame performs when unwound.
///
/// `Run` holds a user finalizer; the `Restore*` variants are the undo
/// finalizers pushed by `Provide`, `PipeTo` and `Bridge`. Restores mutate
/// executor state synchronously; the pipe and bridge variants additionally
/// contribute a close task for the executor they displaced.
pub(crate) enum Finalizer {
    /// A user-supplied cleanup task.
    Run(FinalizerFn),
    /// Restores the previous environment.
    RestoreEnv(Option<Payload>),
    /// Restores the upstream linkage displaced by `PipeTo` and closes the
    /// interposed executor.
    RestorePipe,
    /// Restores the handoff linkage displaced by `Bridge` and shuts the
    /// forked pump down, folding its close failures in.
    RestoreBridge {
        /// Handle to the forked pump, if one was forked.
        guard: BridgeGuard,
        /// The handoff linkage that was in place before the bridge.
        previous: Option<Handoff>,
    },
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(_) => write!(f, "Run"),
            Self::RestoreEnv(_) => write!(f, "RestoreEnv"),
            Self::RestorePipe => write!(f, "RestorePipe"),
            Self::RestoreBridge { .. } => write!(f, "RestoreBridge"),
        }
    }
}

/// Stop signal and join handle for one forked bridge pump.
pub(crate) struct PumpHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<(), Cause>>,
}

/// Shared slot for the bridge pump's stop signal and join handle.
///
/// The slot is only populated once the spawn task has run; shutting an empty
/// guard down is a no-op.
#[derive(Clone, Default)]
pub(crate) struct BridgeGuard {
    inner: Arc<Mutex<Option<PumpHandle>>>,
}

impl BridgeGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn store(&self, stop: watch::Sender<bool>, handle: JoinHandle<Result<(), Cause>>) {
        *self.inner.lock() = Some(PumpHandle { stop, handle });
    }

    /// A task that asks the pump to stop and waits until it has closed the
    /// displaced upstream, surfacing any finalizer failure from that close.
    pub(crate) fn shutdown(&self) -> Task {
        let slot = Arc::clone(&self.inner);
        Task::from_future(async move {
            let taken = slot.lock().take();
            let Some(pump) = taken else {
                return Ok(Payload::unit());
            };
            let _ = pump.stop.send(true);
            match pump.handle.await {
                Ok(Ok(())) => Ok(Payload::unit()),
                Ok(Err(cause)) => Err(cause),
                Err(join) if join.is_panic() => Err(Cause::from_panic(join.into_panic())),
                Err(_) => Err(Cause::Interrupt),
            }
        })
        .uninterruptible()
    }
}

/// A cleanup batch handed to the host, kept rebuildable so `close` can fold
/// an abandoned in-flight batch back in.
pub(crate) struct CleanupBatch {
    pub(crate) finalizers: Vec<FinalizerFn>,
    pub(crate) outcome: Outcome,
}

impl fmt::Debug for CleanupBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupBatch")
            .field("finalizers", &self.finalizers.len())
            .field("outcome", &self.outcome)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_guard_shutdown_without_pump_is_noop() {
        let guard = BridgeGuard::new();
        assert!(guard.shutdown().await.is_ok());
        // A second shutdown finds the slot empty.
        assert!(guard.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_bridge_guard_shutdown_stops_and_joins_the_pump() {
        let guard = BridgeGuard::new();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            stop_rx.changed().await.ok();
            Ok(())
        });
        guard.store(stop_tx, handle);
        assert!(guard.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_bridge_guard_surfaces_pump_close_failure() {
        let guard = BridgeGuard::new();
        let (stop_tx, _stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async { Err(Cause::fail("release blew up")) });
        guard.store(stop_tx, handle);
        assert!(matches!(guard.shutdown().await, Err(Cause::Fail(_))));
    }

    #[tokio::test]
    async fn test_bridge_guard_reports_panicked_pump_as_die() {
        let guard = BridgeGuard::new();
        let (stop_tx, _stop_rx) = watch::channel(false);
        let handle: JoinHandle<Result<(), Cause>> =
            tokio::spawn(async { panic!("pump exploded") });
        guard.store(stop_tx, handle);
        assert!(matches!(guard.shutdown().await, Err(Cause::Die(_))));
    }
}
