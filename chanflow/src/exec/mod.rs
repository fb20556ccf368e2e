//! The channel executor: a resumable, trampolined driver loop.
//!
//! `step()` is called repeatedly by an external scheduler and returns one
//! [`Step`]. Constructs that would otherwise require deep native recursion
//! (concatenation chains, nested folds, chained upstream reads) are flattened
//! into the continuation stack, the sub-pipeline frame stack, and the
//! explicit read frames walked by [`reader`].

mod continuation;
mod reader;
mod subexec;


use crate::bridge::Signal;
use crate::errors::EngineError;
use crate::node::{ChannelNode, DoneFn, FinalizerFn, MoreFn};
use crate::outcome::{Cause, Outcome, Payload};
use crate::task::{run_sequenced, Task, TaskResult};
use continuation::{BridgeGuard, CleanupBatch, ContinuationFrame, Finalizer};
use std::collections::VecDeque;
use std::sync::Arc;
use subexec::{close_subexec, PullingUpstream, Subexec};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// The result of one interpretation step.
#[derive(Debug)]
pub enum Step {
    /// The channel terminated; the outcome is also available via
    /// [`ChannelExecutor::outcome`].
    Finished(Outcome),
    /// The channel emitted a value; also available via
    /// [`ChannelExecutor::produced`].
    Produced(Payload),
    /// Run the task, feed its result to [`ChannelExecutor::resume`], then
    /// step again.
    Suspend(Task),
    /// The channel needs upstream input and none is attached; feed it via
    /// [`ChannelExecutor::feed_more`] or [`ChannelExecutor::feed_done`].
    NeedsUpstream,
}

/// Internal single-executor transition result.
pub(crate) enum LocalStep {
    /// Progress was made; interpret again.
    Continue,
    /// A value was emitted.
    Emitted(Payload),
    /// A terminal outcome was recorded.
    Done(Outcome),
    /// A deferred computation must run before progress continues.
    Suspended(Task),
    /// A read frame was pushed; the upstream must be driven.
    AwaitUpstream,
    /// An upstream read surfaced with no upstream attached anywhere.
    AwaitExternal,
}

/// A pending upstream read continuation.
pub(crate) struct ReadFrame {
    pub(crate) on_more: MoreFn,
    pub(crate) on_done: DoneFn,
}

/// The upstream linkage of an executor.
pub(crate) enum UpstreamHandle {
    /// A pull-driven upstream executor.
    Exec(Box<ChannelExecutor>),
    /// A handoff fed by a push-style producer (see [`crate::bridge`]).
    Handoff(crate::bridge::Handoff),
}

/// What to do with the result of the outstanding suspended task.
enum PendingResume {
    /// The result becomes this channel's terminal value.
    IntoDone,
    /// A bracket acquisition completed.
    BracketAcquired {
        release: crate::node::ReleaseFn,
    },
    /// A cleanup batch finished; resume unwinding.
    AfterCleanup,
    /// A handoff read completed.
    HandoffRead,
    /// The bridge pump was spawned.
    AfterSpawn,
    /// A cancellation close batch finished.
    Closing {
        outcome: Outcome,
    },
    /// An early child close finished.
    AfterChildClose,
    /// A concatenation teardown finished; unwind with the stored outcome.
    AfterTeardown {
        outcome: Outcome,
    },
    /// The suspension belongs to the active sub-pipeline's inner executor.
    Subexec,
}

/// A resumable interpreter for one [`ChannelNode`] tree.
///
/// All mutable state is exclusively owned by the single logical thread
/// driving this instance; other executors are only touched through their own
/// `step`/`resume`/`close` surface.
pub struct ChannelExecutor {
    current: Option<ChannelNode>,
    stack: Vec<ContinuationFrame>,
    read_stack: Vec<ReadFrame>,
    active_sub: Option<Subexec>,
    input: Option<UpstreamHandle>,
    env: Option<Payload>,
    emitted: Option<Payload>,
    done: Option<Outcome>,
    pending: Option<PendingResume>,
    unwinding: Option<Outcome>,
    queued_suspend: Option<Task>,
    in_progress: Option<CleanupBatch>,
    cancel_requested: Option<Outcome>,
}

impl ChannelExecutor {
    /// Creates an executor over an already-built channel description.
    #[must_use]
    pub fn new(node: ChannelNode) -> Self {
        Self {
            current: Some(node),
            stack: Vec::new(),
            read_stack: Vec::new(),
            active_sub: None,
            input: None,
            env: None,
            emitted: None,
            done: None,
            pending: None,
            unwinding: None,
            queued_suspend: None,
            in_progress: None,
            cancel_requested: None,
        }
    }

    /// Sets the initial environment.
    #[must_use]
    pub fn with_env(mut self, env: Payload) -> Self {
        self.env = Some(env);
        self
    }

    pub(crate) fn with_inherited_env(mut self, env: Option<Payload>) -> Self {
        self.env = env;
        self
    }

    /// Performs one interpretation step.
    ///
    /// A pending cancellation is observed here, before any node
    /// interpretation, and short-circuits into [`Self::close`]. No panic from
    /// user closures escapes: synchronous panics become [`Cause::Die`] and
    /// route through the normal unwinding path.
    pub fn step(&mut self) -> Step {
        self.emitted = None;
        if let Some(outcome) = self.cancel_requested.take() {
            if self.done.is_none() {
                debug!("cancellation observed; closing");
                return self.begin_close(outcome);
            }
        }
        self.drive()
    }

    /// The terminal outcome, valid once `step` has returned
    /// [`Step::Finished`].
    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.done.as_ref()
    }

    /// The value produced by the most recent step, if it was
    /// [`Step::Produced`].
    #[must_use]
    pub fn produced(&self) -> Option<&Payload> {
        self.emitted.as_ref()
    }

    /// Like [`Self::outcome`], but reports a still-running executor as an
    /// error.
    pub fn try_outcome(&self) -> Result<&Outcome, EngineError> {
        self.done.as_ref().ok_or(EngineError::OutcomeUnavailable)
    }

    /// Like [`Self::produced`], but reports a non-emitting step as an error.
    pub fn try_produced(&self) -> Result<&Payload, EngineError> {
        self.emitted.as_ref().ok_or(EngineError::EmissionUnavailable)
    }

    /// The active environment installed by the innermost `Provide`.
    #[must_use]
    pub fn environment(&self) -> Option<&Payload> {
        self.env.as_ref()
    }

    /// Returns true once a terminal outcome has been recorded.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_some()
    }

    /// Requests cooperative cancellation with the given outcome.
    ///
    /// Observed at the top of the next `step()`; pending cleanup still runs,
    /// uninterruptibly, before the executor reports `Finished`.
    pub fn request_cancellation(&mut self, outcome: Outcome) {
        if self.cancel_requested.is_none() {
            self.cancel_requested = Some(outcome);
        }
    }

    /// Feeds the result of a suspended task back into the executor.
    ///
    /// Routes iteratively to whichever executor in the tree (self, the
    /// upstream chain, or the active sub-pipeline's inner executor) issued
    /// the suspension.
    pub fn resume(&mut self, result: TaskResult) {
        let mut cur: &mut ChannelExecutor = self;
        loop {
            match cur.pending.take() {
                Some(PendingResume::Subexec) => {
                    let Some(inner) = cur.subexec_primary_mut() else {
                        warn!("sub-pipeline resume with no inner executor");
                        return;
                    };
                    cur = inner;
                }
                Some(kind) => {
                    cur.apply_resume(kind, result);
                    return;
                }
                None => {
                    if cur.awaiting_upstream() {
                        cur = match cur.input {
                            Some(UpstreamHandle::Exec(ref mut up)) => up,
                            _ => {
                                warn!("resume with no suspended executor on the upstream path");
                                return;
                            }
                        };
                    } else {
                        warn!("resume without an outstanding suspension");
                        return;
                    }
                }
            }
        }
    }

    /// Resolves a surfaced [`Step::NeedsUpstream`] with an emission.
    pub fn feed_more(&mut self, value: Payload) {
        let mut cur: &mut ChannelExecutor = self;
        loop {
            if cur.awaiting_upstream() {
                match cur.input {
                    None => {
                        cur.apply_read_more(value);
                        return;
                    }
                    Some(UpstreamHandle::Exec(ref mut up)) => cur = up,
                    Some(UpstreamHandle::Handoff(_)) => {
                        warn!("feed_more on a bridged executor; use the handoff instead");
                        return;
                    }
                }
            } else if let Some(inner) = cur.subexec_primary_mut() {
                cur = inner;
            } else {
                warn!("feed_more with no pending external read");
                return;
            }
        }
    }

    /// Resolves a surfaced [`Step::NeedsUpstream`] with a terminal outcome.
    pub fn feed_done(&mut self, outcome: Outcome) {
        let mut cur: &mut ChannelExecutor = self;
        loop {
            if cur.awaiting_upstream() {
                match cur.input {
                    None => {
                        cur.apply_read_done(outcome);
                        return;
                    }
                    Some(UpstreamHandle::Exec(ref mut up)) => cur = up,
                    Some(UpstreamHandle::Handoff(_)) => {
                        warn!("feed_done on a bridged executor; use the handoff instead");
                        return;
                    }
                }
            } else if let Some(inner) = cur.subexec_primary_mut() {
                cur = inner;
            } else {
                warn!("feed_done with no pending external read");
                return;
            }
        }
    }

    /// Builds the combined close action for this executor's scope.
    ///
    /// Combines, uninterruptibly: any cleanup batch already in progress, the
    /// active sub-pipeline's own close (recursively), and the remaining
    /// continuation stack reduced to cleanup frames (plus the owned upstream
    /// chain). Returns `None` when there is nothing to clean up.
    pub fn close(&mut self, outcome: &Outcome) -> Option<Task> {
        let mut groups: Vec<Task> = Vec::new();

        if let Some(batch) = self.in_progress.take() {
            let tasks: Vec<Task> = batch.finalizers.iter().map(|f| f(&batch.outcome)).collect();
            if !tasks.is_empty() {
                groups.push(run_sequenced(tasks));
            }
        }

        if let Some(sub) = self.active_sub.take() {
            if let Some(task) = close_subexec(sub, outcome) {
                groups.push(task);
            }
        }

        let mut tasks = Vec::new();
        let mut rebuildable = Vec::new();
        while let Some(frame) = self.stack.pop() {
            if let ContinuationFrame::Cleanup(finalizer) = frame {
                self.collect_finalizer(finalizer, outcome, &mut tasks, &mut rebuildable);
            }
        }
        if let Some(UpstreamHandle::Exec(mut upstream)) = self.input.take() {
            if let Some(task) = upstream.close(outcome) {
                tasks.push(task);
            }
        }
        if !tasks.is_empty() {
            groups.push(run_sequenced(tasks));
        }

        self.current = None;
        self.read_stack.clear();
        self.pending = None;
        self.queued_suspend = None;

        if groups.is_empty() {
            None
        } else {
            debug!(groups = groups.len(), "close batch assembled");
            Some(run_sequenced(groups))
        }
    }

    pub(crate) fn take_input(&mut self) -> Option<UpstreamHandle> {
        self.input.take()
    }

    pub(crate) fn awaiting_upstream(&self) -> bool {
        !self.read_stack.is_empty()
    }

    fn begin_close(&mut self, outcome: Outcome) -> Step {
        match self.close(&outcome) {
            Some(task) => {
                self.pending = Some(PendingResume::Closing { outcome });
                Step::Suspend(task)
            }
            None => {
                self.done = Some(outcome.clone());
                Step::Finished(outcome)
            }
        }
    }

    /// One transition of this executor alone, never touching the upstream
    /// chain (the reader walk owns that).
    pub(crate) fn step_local(&mut self) -> LocalStep {
        if let Some(task) = self.queued_suspend.take() {
            return LocalStep::Suspended(task);
        }
        if let Some(outcome) = self.done.clone() {
            return LocalStep::Done(outcome);
        }
        if let Some(outcome) = self.unwinding.take() {
            return self.unwind(outcome);
        }
        if self.active_sub.is_some() {
            return self.step_subexec();
        }
        let Some(node) = self.current.take() else {
            warn!("executor stepped with no current channel");
            return self.unwind(Outcome::Failure(Cause::die(
                "executor has no current channel",
            )));
        };
        trace!(node = node.tag(), "interpreting");
        match node {
            ChannelNode::SucceedNow { value } => self.unwind(Outcome::Success(value)),
            ChannelNode::Fail { cause } => {
                let cause = match catch(cause) {
                    Ok(cause) => cause,
                    Err(defect) => defect,
                };
                self.unwind(Outcome::Failure(cause))
            }
            ChannelNode::Succeed { value } => match catch(value) {
                Ok(value) => self.unwind(Outcome::Success(value)),
                Err(defect) => self.unwind(Outcome::Failure(defect)),
            },
            ChannelNode::Suspend { build } => {
                self.current = Some(match catch(build) {
                    Ok(node) => node,
                    Err(defect) => ChannelNode::halt(defect),
                });
                LocalStep::Continue
            }
            ChannelNode::Deferred { effect } => {
                let env = self.env.clone();
                match catch(move || effect(env)) {
                    Ok(task) => {
                        self.pending = Some(PendingResume::IntoDone);
                        LocalStep::Suspended(task)
                    }
                    Err(defect) => self.unwind(Outcome::Failure(defect)),
                }
            }
            ChannelNode::Emit { value } => {
                self.current = Some(ChannelNode::unit());
                LocalStep::Emitted(value)
            }
            ChannelNode::Read { on_more, on_done } => {
                self.read_stack.push(ReadFrame { on_more, on_done });
                LocalStep::AwaitUpstream
            }
            ChannelNode::Fold {
                inner,
                on_success,
                on_failure,
            } => {
                self.stack.push(ContinuationFrame::Fold {
                    on_success,
                    on_failure,
                });
                self.current = Some(*inner);
                LocalStep::Continue
            }
            ChannelNode::AttachCleanup { inner, finalizer } => {
                self.stack
                    .push(ContinuationFrame::Cleanup(Finalizer::Run(finalizer)));
                self.current = Some(*inner);
                LocalStep::Continue
            }
            ChannelNode::Provide { env, inner } => {
                let previous = self.env.replace(env);
                self.stack
                    .push(ContinuationFrame::Cleanup(Finalizer::RestoreEnv(previous)));
                self.current = Some(*inner);
                LocalStep::Continue
            }
            ChannelNode::PipeTo { left, right } => {
                let mut left_exec =
                    Box::new(Self::new(*left).with_inherited_env(self.env.clone()));
                left_exec.input = self.input.take();
                self.input = Some(UpstreamHandle::Exec(left_exec));
                self.stack
                    .push(ContinuationFrame::Cleanup(Finalizer::RestorePipe));
                self.current = Some(match catch(right) {
                    Ok(node) => node,
                    Err(defect) => ChannelNode::halt(defect),
                });
                LocalStep::Continue
            }
            ChannelNode::Concatenate {
                source,
                child,
                combine_results,
                combine_with_last,
                pull_policy,
                on_emit,
            } => {
                let mut upstream =
                    Box::new(Self::new(*source).with_inherited_env(self.env.clone()));
                upstream.input = self.input.take();
                self.active_sub = Some(Subexec::PullingUpstream(PullingUpstream {
                    upstream,
                    child,
                    last_done: None,
                    active_children: VecDeque::new(),
                    combine_results,
                    combine_with_last,
                    pull_policy,
                    on_emit,
                }));
                LocalStep::Continue
            }
            ChannelNode::Bracket { acquire, release } => match catch(acquire) {
                Ok(task) => {
                    self.pending = Some(PendingResume::BracketAcquired { release });
                    LocalStep::Suspended(task.uninterruptible())
                }
                Err(defect) => self.unwind(Outcome::Failure(defect)),
            },
            ChannelNode::Bridge { handoff, inner } => {
                let previous = self.input.take();
                self.input = Some(UpstreamHandle::Handoff(handoff.clone()));
                self.current = Some(*inner);
                match previous {
                    Some(UpstreamHandle::Exec(upstream)) => {
                        debug!("bridging push-style upstream through handoff");
                        let guard = BridgeGuard::new();
                        self.stack
                            .push(ContinuationFrame::Cleanup(Finalizer::RestoreBridge {
                                guard: guard.clone(),
                                previous: None,
                            }));
                        let task = Task::from_future(async move {
                            let (stop_tx, stop_rx) = watch::channel(false);
                            let handle =
                                tokio::spawn(crate::bridge::pump(*upstream, handoff, stop_rx));
                            guard.store(stop_tx, handle);
                            Ok(Payload::unit())
                        });
                        self.pending = Some(PendingResume::AfterSpawn);
                        LocalStep::Suspended(task)
                    }
                    Some(UpstreamHandle::Handoff(prior)) => {
                        self.stack
                            .push(ContinuationFrame::Cleanup(Finalizer::RestoreBridge {
                                guard: BridgeGuard::new(),
                                previous: Some(prior),
                            }));
                        LocalStep::Continue
                    }
                    None => {
                        self.stack
                            .push(ContinuationFrame::Cleanup(Finalizer::RestoreBridge {
                                guard: BridgeGuard::new(),
                                previous: None,
                            }));
                        LocalStep::Continue
                    }
                }
            }
        }
    }

    /// Pops the continuation stack with a terminal outcome.
    ///
    /// Fold frames redirect interpretation; consecutive cleanup frames are
    /// collected into one batch that never short-circuits, with failures
    /// combined sequentially; an empty stack records the outcome.
    pub(crate) fn unwind(&mut self, outcome: Outcome) -> LocalStep {
        loop {
            match self.stack.pop() {
                None => {
                    trace!("terminal outcome recorded");
                    self.current = None;
                    self.done = Some(outcome.clone());
                    return LocalStep::Done(outcome);
                }
                Some(ContinuationFrame::Fold {
                    on_success,
                    on_failure,
                }) => {
                    let next = match outcome {
                        Outcome::Success(value) => catch(move || on_success(value)),
                        Outcome::Failure(cause) => catch(move || on_failure(cause)),
                    };
                    self.current = Some(match next {
                        Ok(node) => node,
                        Err(defect) => ChannelNode::halt(defect),
                    });
                    return LocalStep::Continue;
                }
                Some(ContinuationFrame::Cleanup(finalizer)) => {
                    let mut tasks = Vec::new();
                    let mut rebuildable = Vec::new();
                    self.collect_finalizer(finalizer, &outcome, &mut tasks, &mut rebuildable);
                    while matches!(self.stack.last(), Some(ContinuationFrame::Cleanup(_))) {
                        if let Some(ContinuationFrame::Cleanup(next)) = self.stack.pop() {
                            self.collect_finalizer(next, &outcome, &mut tasks, &mut rebuildable);
                        }
                    }
                    if tasks.is_empty() {
                        continue;
                    }
                    debug!(count = tasks.len(), "running cleanup batch");
                    self.in_progress = Some(CleanupBatch {
                        finalizers: rebuildable,
                        outcome: outcome.clone(),
                    });
                    self.pending = Some(PendingResume::AfterCleanup);
                    return LocalStep::Suspended(run_sequenced(tasks));
                }
            }
        }
    }

    /// Applies one cleanup frame: restores are synchronous, user finalizers
    /// become tasks (and stay rebuildable for `close`).
    fn collect_finalizer(
        &mut self,
        finalizer: Finalizer,
        outcome: &Outcome,
        tasks: &mut Vec<Task>,
        rebuildable: &mut Vec<FinalizerFn>,
    ) {
        match finalizer {
            Finalizer::Run(f) => {
                tasks.push(f(outcome));
                rebuildable.push(f);
            }
            Finalizer::RestoreEnv(previous) => {
                self.env = previous;
            }
            Finalizer::RestorePipe => {
                if let Some(UpstreamHandle::Exec(mut left)) = self.input.take() {
                    self.input = left.take_input();
                    if let Some(task) = left.close(outcome) {
                        tasks.push(task);
                    }
                }
            }
            Finalizer::RestoreBridge { guard, previous } => {
                if matches!(self.input, Some(UpstreamHandle::Handoff(_))) {
                    self.input = previous.map(UpstreamHandle::Handoff);
                }
                tasks.push(guard.shutdown());
            }
        }
    }

    fn apply_resume(&mut self, kind: PendingResume, result: TaskResult) {
        match kind {
            PendingResume::IntoDone => {
                self.current = Some(match result {
                    Ok(value) => ChannelNode::succeed_now(value),
                    Err(cause) => ChannelNode::halt(cause),
                });
            }
            PendingResume::BracketAcquired { release } => match result {
                Ok(resource) => {
                    let guard = release.clone();
                    let held = resource.clone();
                    self.stack
                        .push(ContinuationFrame::Cleanup(Finalizer::Run(Arc::new(
                            move |outcome: &Outcome| guard(&held, outcome),
                        ))));
                    self.current = Some(ChannelNode::emit(resource));
                }
                Err(cause) => {
                    self.current = Some(ChannelNode::halt(cause));
                }
            },
            PendingResume::AfterCleanup => {
                let Some(batch) = self.in_progress.take() else {
                    warn!("cleanup resume with no batch in progress");
                    return;
                };
                let outcome = match result {
                    Ok(_) => batch.outcome,
                    Err(cause) => batch.outcome.with_finalizer_failure(cause),
                };
                self.unwinding = Some(outcome);
            }
            PendingResume::HandoffRead => match result {
                Ok(payload) => match payload.downcast_ref::<Signal>().cloned() {
                    Some(Signal::Emitted(value)) => self.apply_read_more(value),
                    Some(Signal::Done(outcome)) => self.apply_read_done(outcome),
                    None => self.apply_read_done(Outcome::Failure(Cause::die(
                        "handoff read produced a non-signal payload",
                    ))),
                },
                Err(cause) => self.apply_read_done(Outcome::Failure(cause)),
            },
            PendingResume::AfterSpawn => {}
            PendingResume::Closing { outcome } => {
                let outcome = match result {
                    Ok(_) => outcome,
                    Err(cause) => outcome.with_finalizer_failure(cause),
                };
                self.done = Some(outcome);
            }
            PendingResume::AfterChildClose => {
                if let Err(cause) = result {
                    let outcome = Outcome::Failure(cause);
                    if let Some(sub) = self.active_sub.take() {
                        match close_subexec(sub, &outcome) {
                            Some(task) => {
                                self.queued_suspend = Some(task);
                                self.pending = Some(PendingResume::AfterTeardown { outcome });
                            }
                            None => self.unwinding = Some(outcome),
                        }
                    } else {
                        self.unwinding = Some(outcome);
                    }
                }
            }
            PendingResume::AfterTeardown { outcome } => {
                let outcome = match result {
                    Ok(_) => outcome,
                    Err(cause) => outcome.with_finalizer_failure(cause),
                };
                self.unwinding = Some(outcome);
            }
            PendingResume::Subexec => {
                warn!("sub-pipeline marker reached apply_resume");
            }
        }
    }

    pub(crate) fn apply_read_more(&mut self, value: Payload) {
        let Some(frame) = self.read_stack.pop() else {
            warn!("emission arrived with no pending read");
            return;
        };
        let on_more = frame.on_more;
        self.current = Some(match catch(move || on_more(value)) {
            Ok(node) => node,
            Err(defect) => ChannelNode::halt(defect),
        });
    }

    pub(crate) fn apply_read_done(&mut self, outcome: Outcome) {
        let Some(frame) = self.read_stack.pop() else {
            warn!("upstream outcome arrived with no pending read");
            return;
        };
        let on_done = frame.on_done;
        self.current = Some(match catch(move || on_done(outcome)) {
            Ok(node) => node,
            Err(defect) => ChannelNode::halt(defect),
        });
    }
}

impl std::fmt::Debug for ChannelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelExecutor")
            .field("current", &self.current)
            .field("stack_depth", &self.stack.len())
            .field("pending_reads", &self.read_stack.len())
            .field("has_subexec", &self.active_sub.is_some())
            .field("done", &self.done)
            .finish()
    }
}

/// Catches panics from user closures, converting them into defects.
fn catch<T>(f: impl FnOnce() -> T) -> Result<T, Cause> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(Cause::from_panic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::drive_to_end;

    #[tokio::test]
    async fn test_succeed_now_finishes_immediately() {
        let mut exec = ChannelExecutor::new(ChannelNode::succeed_now(Payload::new(9_i32)));
        let (produced, outcome) = drive_to_end(&mut exec).await;
        assert!(produced.is_empty());
        assert_eq!(
            outcome.success().and_then(|p| p.downcast_ref::<i32>().copied()),
            Some(9)
        );
    }

    #[tokio::test]
    async fn test_emit_then_finish() {
        let node = ChannelNode::emit_value(1_i32).zip_right(ChannelNode::emit_value(2_i32));
        let mut exec = ChannelExecutor::new(node);
        let (produced, outcome) = drive_to_end(&mut exec).await;
        let values: Vec<i32> = produced
            .iter()
            .filter_map(|p| p.downcast_ref::<i32>().copied())
            .collect();
        assert_eq!(values, vec![1, 2]);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_panicking_thunk_becomes_die() {
        let node = ChannelNode::Succeed {
            value: Box::new(|| panic!("thunk exploded")),
        };
        let mut exec = ChannelExecutor::new(node);
        let (_, outcome) = drive_to_end(&mut exec).await;
        match outcome.cause() {
            Some(Cause::Die(payload)) => {
                assert_eq!(
                    payload.downcast_ref::<String>().map(String::as_str),
                    Some("thunk exploded")
                );
            }
            other => panic!("expected Die, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finished_is_idempotent() {
        let mut exec = ChannelExecutor::new(ChannelNode::unit());
        assert!(matches!(exec.try_outcome(), Err(EngineError::OutcomeUnavailable)));
        let (_, first) = drive_to_end(&mut exec).await;
        assert!(first.is_success());
        assert!(matches!(exec.step(), Step::Finished(_)));
        assert!(exec.try_outcome().is_ok());
        assert!(matches!(exec.try_produced(), Err(EngineError::EmissionUnavailable)));
    }

    #[tokio::test]
    async fn test_fold_recovers_from_failure() {
        let node = ChannelNode::Fold {
            inner: Box::new(ChannelNode::halt(Cause::fail("expected"))),
            on_success: Box::new(ChannelNode::succeed_now),
            on_failure: Box::new(|_| ChannelNode::succeed_now(Payload::new(42_i32))),
        };
        let mut exec = ChannelExecutor::new(node);
        let (_, outcome) = drive_to_end(&mut exec).await;
        assert_eq!(
            outcome.success().and_then(|p| p.downcast_ref::<i32>().copied()),
            Some(42)
        );
    }

    #[tokio::test]
    async fn test_deferred_sees_provided_environment() {
        let node = ChannelNode::Provide {
            env: Payload::new("ctx".to_string()),
            inner: Box::new(ChannelNode::Deferred {
                effect: Box::new(|env| {
                    Task::from_fn(move || {
                        let env = env.ok_or_else(|| Cause::die("environment missing"))?;
                        let text = env
                            .downcast_ref::<String>()
                            .cloned()
                            .ok_or_else(|| Cause::die("environment type"))?;
                        Ok(Payload::new(text))
                    })
                }),
            }),
        };
        let mut exec = ChannelExecutor::new(node);
        let (_, outcome) = drive_to_end(&mut exec).await;
        assert_eq!(
            outcome
                .success()
                .and_then(|p| p.downcast_ref::<String>().cloned()),
            Some("ctx".to_string())
        );
        // The environment swap was undone on unwind.
        assert!(exec.environment().is_none());
    }

    #[tokio::test]
    async fn test_initial_environment_reaches_deferred_effects() {
        let node = ChannelNode::Deferred {
            effect: Box::new(|env| {
                Task::from_fn(move || match env {
                    Some(env) => Ok(env),
                    None => Err(Cause::die("environment missing")),
                })
            }),
        };
        let mut exec = ChannelExecutor::new(node).with_env(Payload::new(7_i32));
        let (_, outcome) = drive_to_end(&mut exec).await;
        assert_eq!(
            outcome.success().and_then(|p| p.downcast_ref::<i32>().copied()),
            Some(7)
        );
    }

    #[tokio::test]
    async fn test_external_read_fed_by_caller() {
        let node = ChannelNode::Read {
            on_more: Box::new(ChannelNode::emit),
            on_done: Box::new(|_| ChannelNode::unit()),
        };
        let mut exec = ChannelExecutor::new(node);
        assert!(matches!(exec.step(), Step::NeedsUpstream));
        exec.feed_more(Payload::new(5_i32));
        match exec.step() {
            Step::Produced(value) => assert_eq!(value.downcast_ref::<i32>(), Some(&5)),
            other => panic!("expected Produced, got {other:?}"),
        }
        exec.feed_done(Outcome::unit());
    }
}
