//! The sub-pipeline frame: per-emission child channels under `Concatenate`.
//!
//! The frame owns the upstream executor and a queue of pending children.
//! Exactly one inner executor is stepped at a time; suspensions bubble to the
//! host through the parent, and a pending marker routes the resume back down.

use super::{catch, ChannelExecutor, LocalStep, PendingResume};
use crate::node::{ChildBuilder, CombineFn};
use crate::outcome::{Cause, Outcome, Payload};
use crate::policy::{ChildDecision, EmitDecisionFn, PullPolicy, PullPolicyFn, PullRequest};
use crate::task::{run_gathered, run_sequenced, Task};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// One entry in the pending-children queue.
pub(crate) enum ChildEntry {
    /// A child executor waiting to run (fresh or yielded).
    Child(Box<ChannelExecutor>),
    /// A separator value to relay between child batches.
    Separator(Payload),
}

/// Shared state of an active concatenation frame.
pub(crate) struct PullingUpstream {
    pub(crate) upstream: Box<ChannelExecutor>,
    pub(crate) child: ChildBuilder,
    pub(crate) last_done: Option<Payload>,
    pub(crate) active_children: VecDeque<ChildEntry>,
    pub(crate) combine_results: CombineFn,
    pub(crate) combine_with_last: CombineFn,
    pub(crate) pull_policy: PullPolicyFn,
    pub(crate) on_emit: EmitDecisionFn,
}

/// A child is being stepped while the upstream is still live.
pub(crate) struct PullingChild {
    pub(crate) frame: PullingUpstream,
    pub(crate) active: Box<ChannelExecutor>,
}

/// The upstream is exhausted; queued children drain in order.
pub(crate) struct Draining {
    pub(crate) frame: PullingUpstream,
    pub(crate) done: Outcome,
    pub(crate) active: Option<Box<ChannelExecutor>>,
}

/// The concatenation frame state machine.
pub(crate) enum Subexec {
    PullingUpstream(PullingUpstream),
    PullingChild(PullingChild),
    Draining(Draining),
}

impl std::fmt::Debug for Subexec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PullingUpstream(_) => write!(f, "PullingUpstream"),
            Self::PullingChild(_) => write!(f, "PullingChild"),
            Self::Draining(_) => write!(f, "Draining"),
        }
    }
}

impl ChannelExecutor {
    /// One transition of the active concatenation frame.
    pub(crate) fn step_subexec(&mut self) -> LocalStep {
        let Some(sub) = self.active_sub.take() else {
            return LocalStep::Continue;
        };
        match sub {
            Subexec::PullingUpstream(frame) => self.pull_upstream(frame),
            Subexec::PullingChild(PullingChild { frame, active }) => {
                self.run_child(frame, active, None)
            }
            Subexec::Draining(state) => self.drain_children(state),
        }
    }

    /// The inner executor currently being stepped, for resume and feed
    /// routing.
    pub(crate) fn subexec_primary_mut(&mut self) -> Option<&mut ChannelExecutor> {
        match self.active_sub.as_mut()? {
            Subexec::PullingUpstream(frame) => Some(&mut *frame.upstream),
            Subexec::PullingChild(state) => Some(&mut *state.active),
            Subexec::Draining(state) => match state.active.as_mut() {
                Some(active) => Some(&mut **active),
                None => Some(&mut *state.frame.upstream),
            },
        }
    }

    fn pull_upstream(&mut self, mut frame: PullingUpstream) -> LocalStep {
        match frame.upstream.step_chain() {
            LocalStep::Emitted(value) => {
                let policy = match catch(|| (frame.pull_policy)(PullRequest::Pulled(&value))) {
                    Ok(policy) => policy,
                    Err(defect) => return self.teardown(frame, None, Outcome::Failure(defect)),
                };
                let builder = frame.child.clone();
                let node = match catch(move || builder(value)) {
                    Ok(node) => node,
                    Err(defect) => return self.teardown(frame, None, Outcome::Failure(defect)),
                };
                let child =
                    Box::new(ChannelExecutor::new(node).with_inherited_env(self.env.clone()));
                match policy {
                    PullPolicy::PullAfterNext { separator } => {
                        trace!("activating child immediately");
                        let relay = separator.filter(|_| frame.last_done.is_some());
                        self.active_sub =
                            Some(Subexec::PullingChild(PullingChild { frame, active: child }));
                        match relay {
                            Some(sep) => LocalStep::Emitted(sep),
                            None => LocalStep::Continue,
                        }
                    }
                    PullPolicy::PullAfterAllEnqueued { separator } => {
                        trace!("enqueueing child; pulling upstream again");
                        if let Some(sep) = separator {
                            if !frame.active_children.is_empty() {
                                frame.active_children.push_back(ChildEntry::Separator(sep));
                            }
                        }
                        frame.active_children.push_back(ChildEntry::Child(child));
                        self.active_sub = Some(Subexec::PullingUpstream(frame));
                        LocalStep::Continue
                    }
                }
            }
            LocalStep::Done(outcome) => {
                if outcome.is_failure() {
                    debug!("upstream failed; tearing down concatenation frame");
                    return self.teardown(frame, None, outcome);
                }
                // The policy is consulted once at exhaustion; `remaining` is
                // the queue length at that moment, which is all either
                // variant looks at.
                let remaining = frame.active_children.len();
                let policy = match catch(|| {
                    (frame.pull_policy)(PullRequest::NoUpstream {
                        active_children: remaining,
                    })
                }) {
                    Ok(policy) => policy,
                    Err(defect) => return self.teardown(frame, None, Outcome::Failure(defect)),
                };
                // Drain-time separators belong to the gather variant;
                // pull-after-next emits its separator when a batch activates.
                // Separators placed at enqueue time take precedence either
                // way.
                let drain_separator = match policy {
                    PullPolicy::PullAfterAllEnqueued { separator } => separator,
                    PullPolicy::PullAfterNext { .. } => None,
                };
                let already_separated = frame
                    .active_children
                    .iter()
                    .any(|entry| matches!(entry, ChildEntry::Separator(_)));
                if !already_separated {
                    if let Some(sep) = drain_separator {
                        let mut interleaved =
                            VecDeque::with_capacity(frame.active_children.len() * 2);
                        for entry in frame.active_children.drain(..) {
                            if !interleaved.is_empty() {
                                interleaved.push_back(ChildEntry::Separator(sep.clone()));
                            }
                            interleaved.push_back(entry);
                        }
                        frame.active_children = interleaved;
                    }
                }
                trace!(remaining, "upstream exhausted; draining children");
                self.active_sub = Some(Subexec::Draining(Draining {
                    frame,
                    done: outcome,
                    active: None,
                }));
                LocalStep::Continue
            }
            LocalStep::Suspended(task) => {
                self.active_sub = Some(Subexec::PullingUpstream(frame));
                self.pending = Some(PendingResume::Subexec);
                LocalStep::Suspended(task)
            }
            LocalStep::AwaitExternal => {
                self.active_sub = Some(Subexec::PullingUpstream(frame));
                LocalStep::AwaitExternal
            }
            LocalStep::Continue | LocalStep::AwaitUpstream => {
                self.active_sub = Some(Subexec::PullingUpstream(frame));
                LocalStep::Continue
            }
        }
    }

    /// Steps the active child. `done` is the upstream's outcome when it is
    /// already exhausted; a paused child then returns to draining instead of
    /// pulling upstream.
    fn run_child(
        &mut self,
        mut frame: PullingUpstream,
        mut active: Box<ChannelExecutor>,
        done: Option<Outcome>,
    ) -> LocalStep {
        match active.step_chain() {
            LocalStep::Emitted(value) => {
                let decision = match catch(|| (frame.on_emit)(&value)) {
                    Ok(decision) => decision,
                    Err(defect) => {
                        return self.teardown(frame, Some(active), Outcome::Failure(defect))
                    }
                };
                match decision {
                    ChildDecision::Continue => {
                        self.store_sub(frame, Some(active), done);
                        LocalStep::Emitted(value)
                    }
                    ChildDecision::Yield => {
                        trace!("child yielded; re-enqueueing");
                        frame.active_children.push_back(ChildEntry::Child(active));
                        self.store_sub(frame, None, done);
                        LocalStep::Emitted(value)
                    }
                    ChildDecision::Close(payload) => {
                        debug!("closing child early by decision");
                        if let Err(cause) =
                            merge_last(&mut frame.last_done, &frame.combine_results, payload)
                        {
                            return self.teardown(frame, Some(active), Outcome::Failure(cause));
                        }
                        if let Some(task) = active.close(&Outcome::unit()) {
                            self.queued_suspend = Some(task);
                            self.pending = Some(PendingResume::AfterChildClose);
                        }
                        self.store_sub(frame, None, done);
                        LocalStep::Emitted(value)
                    }
                }
            }
            LocalStep::Done(Outcome::Success(value)) => {
                if let Err(cause) = merge_last(&mut frame.last_done, &frame.combine_results, value)
                {
                    return self.teardown(frame, None, Outcome::Failure(cause));
                }
                self.store_sub(frame, None, done);
                LocalStep::Continue
            }
            LocalStep::Done(Outcome::Failure(cause)) => {
                debug!("child failed; tearing down concatenation frame");
                self.teardown(frame, None, Outcome::Failure(cause))
            }
            LocalStep::Suspended(task) => {
                self.store_sub(frame, Some(active), done);
                self.pending = Some(PendingResume::Subexec);
                LocalStep::Suspended(task)
            }
            LocalStep::AwaitExternal => {
                self.store_sub(frame, Some(active), done);
                LocalStep::AwaitExternal
            }
            LocalStep::Continue | LocalStep::AwaitUpstream => {
                self.store_sub(frame, Some(active), done);
                LocalStep::Continue
            }
        }
    }

    fn drain_children(&mut self, state: Draining) -> LocalStep {
        let Draining {
            mut frame,
            done,
            active,
        } = state;
        if let Some(active) = active {
            return self.run_child(frame, active, Some(done));
        }
        match frame.active_children.pop_front() {
            Some(ChildEntry::Child(child)) => {
                self.store_sub(frame, Some(child), Some(done));
                LocalStep::Continue
            }
            Some(ChildEntry::Separator(value)) => {
                self.store_sub(frame, None, Some(done));
                LocalStep::Emitted(value)
            }
            None => self.finish_concat(frame, done),
        }
    }

    /// All children done and upstream exhausted: recover the lent input and
    /// terminate with the merged result.
    fn finish_concat(&mut self, mut frame: PullingUpstream, done: Outcome) -> LocalStep {
        self.input = frame.upstream.take_input();
        let outcome = match done {
            Outcome::Success(value) => match frame.last_done.take() {
                Some(acc) => {
                    let combine = frame.combine_with_last.clone();
                    match catch(move || combine(acc, value)) {
                        Ok(merged) => Outcome::Success(merged),
                        Err(defect) => Outcome::Failure(defect),
                    }
                }
                None => Outcome::Success(value),
            },
            failure @ Outcome::Failure(_) => failure,
        };
        self.unwind(outcome)
    }

    /// Abandons the frame on failure: recovers the lent input, closes the
    /// still-running children and the upstream, then unwinds.
    fn teardown(
        &mut self,
        mut frame: PullingUpstream,
        active: Option<Box<ChannelExecutor>>,
        outcome: Outcome,
    ) -> LocalStep {
        self.input = frame.upstream.take_input();
        let sub = Subexec::Draining(Draining {
            frame,
            done: Outcome::unit(),
            active,
        });
        match close_subexec(sub, &outcome) {
            Some(task) => {
                self.pending = Some(PendingResume::AfterTeardown { outcome });
                LocalStep::Suspended(task)
            }
            None => self.unwind(outcome),
        }
    }

    fn store_sub(
        &mut self,
        frame: PullingUpstream,
        active: Option<Box<ChannelExecutor>>,
        done: Option<Outcome>,
    ) {
        self.active_sub = Some(match done {
            Some(done) => Subexec::Draining(Draining {
                frame,
                done,
                active,
            }),
            None => match active {
                Some(active) => Subexec::PullingChild(PullingChild { frame, active }),
                None => Subexec::PullingUpstream(frame),
            },
        });
    }
}

/// Builds the close action for an entire frame: children first (gathered),
/// then the upstream, all uninterruptible and never short-circuiting.
pub(crate) fn close_subexec(sub: Subexec, outcome: &Outcome) -> Option<Task> {
    let (mut frame, active) = match sub {
        Subexec::PullingUpstream(frame) => (frame, None),
        Subexec::PullingChild(PullingChild { frame, active }) => (frame, Some(active)),
        Subexec::Draining(Draining { frame, active, .. }) => (frame, active),
    };
    let mut child_tasks = Vec::new();
    if let Some(mut child) = active {
        if let Some(task) = child.close(outcome) {
            child_tasks.push(task);
        }
    }
    for entry in frame.active_children.drain(..) {
        if let ChildEntry::Child(mut child) = entry {
            if let Some(task) = child.close(outcome) {
                child_tasks.push(task);
            }
        }
    }
    let mut groups = Vec::new();
    if !child_tasks.is_empty() {
        groups.push(run_gathered(child_tasks));
    }
    if let Some(task) = frame.upstream.close(outcome) {
        groups.push(task);
    }
    if groups.is_empty() {
        None
    } else {
        Some(run_sequenced(groups))
    }
}

fn merge_last(slot: &mut Option<Payload>, combine: &CombineFn, value: Payload) -> Result<(), Cause> {
    *slot = Some(match slot.take() {
        Some(acc) => {
            let combine = combine.clone();
            catch(move || combine(acc, value))?
        }
        None => value,
    });
    Ok(())
}
