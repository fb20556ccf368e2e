//! The declarative pipeline description consumed by the executor.
//!
//! A [`ChannelNode`] tree is produced by an out-of-scope builder and is
//! progressively, destructively consumed as the driver loop advances. The
//! constructors here are the hand-over boundary with that builder; they are
//! deliberately thin and add no combinator surface beyond `Fold` sugar.

use crate::bridge::Handoff;
use crate::outcome::{Cause, Outcome, Payload};
use crate::policy::{EmitDecisionFn, PullPolicyFn};
use crate::task::Task;
use std::fmt;
use std::sync::Arc;

/// Lazily builds the next channel node.
pub type NodeThunk = Box<dyn FnOnce() -> ChannelNode + Send>;

/// Lazily produces a success value.
pub type ValueThunk = Box<dyn FnOnce() -> Payload + Send>;

/// Lazily produces a failure cause.
pub type CauseThunk = Box<dyn FnOnce() -> Cause + Send>;

/// Continues a read or fold with an upstream emission or success value.
pub type MoreFn = Box<dyn FnOnce(Payload) -> ChannelNode + Send>;

/// Continues a read with the upstream's terminal outcome.
pub type DoneFn = Box<dyn FnOnce(Outcome) -> ChannelNode + Send>;

/// Continues a fold with a failure cause.
pub type FailFn = Box<dyn FnOnce(Cause) -> ChannelNode + Send>;

/// Builds a deferred computation from the active environment.
pub type EffectFn = Box<dyn FnOnce(Option<Payload>) -> Task + Send>;

/// A cleanup action run when the owning scope closes.
pub type FinalizerFn = Arc<dyn Fn(&Outcome) -> Task + Send + Sync>;

/// Acquires a resource for a bracket.
pub type AcquireFn = Box<dyn FnOnce() -> Task + Send>;

/// Releases a bracket-acquired resource.
pub type ReleaseFn = Arc<dyn Fn(&Payload, &Outcome) -> Task + Send + Sync>;

/// Builds a child pipeline from an upstream emission.
pub type ChildBuilder = Arc<dyn Fn(Payload) -> ChannelNode + Send + Sync>;

/// Merges two result payloads.
pub type CombineFn = Arc<dyn Fn(Payload, Payload) -> Payload + Send + Sync>;

/// Tagged-variant description of a channel.
pub enum ChannelNode {
    /// Decouples a push-driven upstream from the pull-driven `inner` channel
    /// through a single-slot handoff.
    Bridge {
        /// The handoff consumed by downstream reads.
        handoff: Handoff,
        /// The channel that reads from the handoff.
        inner: Box<ChannelNode>,
    },
    /// Runs `left` as the upstream of the channel built by `right`.
    PipeTo {
        /// The upstream channel.
        left: Box<ChannelNode>,
        /// Builds the downstream channel.
        right: NodeThunk,
    },
    /// Requests one element from upstream.
    Read {
        /// Continuation for an upstream emission.
        on_more: MoreFn,
        /// Continuation for the upstream's terminal outcome.
        on_done: DoneFn,
    },
    /// Terminates immediately with a success value.
    SucceedNow {
        /// The success value.
        value: Payload,
    },
    /// Terminates with a lazily built failure cause.
    Fail {
        /// Produces the cause.
        cause: CauseThunk,
    },
    /// Terminates with a lazily computed success value.
    Succeed {
        /// Produces the value.
        value: ValueThunk,
    },
    /// Defers construction of the next node.
    Suspend {
        /// Builds the next node.
        build: NodeThunk,
    },
    /// Runs a deferred computation; its result becomes the terminal outcome.
    Deferred {
        /// Builds the computation from the active environment.
        effect: EffectFn,
    },
    /// Emits one value downstream, then succeeds with unit.
    Emit {
        /// The emitted value.
        value: Payload,
    },
    /// Guarantees `finalizer` runs when the wrapped channel's scope closes.
    AttachCleanup {
        /// The wrapped channel.
        inner: Box<ChannelNode>,
        /// The cleanup action.
        finalizer: FinalizerFn,
    },
    /// Spawns a child pipeline per upstream emission and flattens the output.
    Concatenate {
        /// The upstream source channel.
        source: Box<ChannelNode>,
        /// Builds a child per emission.
        child: ChildBuilder,
        /// Merges child results together.
        combine_results: CombineFn,
        /// Merges the accumulated child result with the upstream result.
        combine_with_last: CombineFn,
        /// Governs upstream pull batching and separators.
        pull_policy: PullPolicyFn,
        /// Per-emission child decision (fairness / early close).
        on_emit: EmitDecisionFn,
    },
    /// Installs success/failure continuations around the wrapped channel.
    Fold {
        /// The wrapped channel.
        inner: Box<ChannelNode>,
        /// Continuation on success.
        on_success: MoreFn,
        /// Continuation on failure.
        on_failure: FailFn,
    },
    /// Uninterruptibly acquires a resource, emits it, and guarantees release.
    Bracket {
        /// Acquires the resource.
        acquire: AcquireFn,
        /// Releases the resource when the scope closes.
        release: ReleaseFn,
    },
    /// Swaps the active environment while running the wrapped channel.
    Provide {
        /// The environment value.
        env: Payload,
        /// The wrapped channel.
        inner: Box<ChannelNode>,
    },
}

impl ChannelNode {
    /// The trivial channel: succeeds with unit.
    #[must_use]
    pub fn unit() -> Self {
        Self::SucceedNow {
            value: Payload::unit(),
        }
    }

    /// Succeeds immediately with `value`.
    #[must_use]
    pub fn succeed_now(value: Payload) -> Self {
        Self::SucceedNow { value }
    }

    /// Fails immediately with `cause`.
    #[must_use]
    pub fn halt(cause: Cause) -> Self {
        Self::Fail {
            cause: Box::new(move || cause),
        }
    }

    /// Emits `value`, then succeeds with unit.
    #[must_use]
    pub fn emit(value: Payload) -> Self {
        Self::Emit { value }
    }

    /// Emits an un-erased value.
    #[must_use]
    pub fn emit_value<T: std::any::Any + Send + Sync>(value: T) -> Self {
        Self::emit(Payload::new(value))
    }

    /// Runs a deferred computation that ignores the environment.
    #[must_use]
    pub fn deferred(task: Task) -> Self {
        Self::Deferred {
            effect: Box::new(move |_| task),
        }
    }

    /// Sequences `f` after this channel's success.
    #[must_use]
    pub fn flat_map<F>(self, f: F) -> Self
    where
        F: FnOnce(Payload) -> Self + Send + 'static,
    {
        Self::Fold {
            inner: Box::new(self),
            on_success: Box::new(f),
            on_failure: Box::new(Self::halt),
        }
    }

    /// Sequences `next` after this channel, discarding this one's result.
    #[must_use]
    pub fn zip_right(self, next: Self) -> Self {
        self.flat_map(move |_| next)
    }

    /// Attaches a finalizer to this channel's scope.
    #[must_use]
    pub fn ensuring(self, finalizer: FinalizerFn) -> Self {
        Self::AttachCleanup {
            inner: Box::new(self),
            finalizer,
        }
    }

    /// Pipes this channel into the one built by `right`.
    #[must_use]
    pub fn pipe_to(self, right: NodeThunk) -> Self {
        Self::PipeTo {
            left: Box::new(self),
            right,
        }
    }

    /// The tag name of this node, for diagnostics.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Bridge { .. } => "Bridge",
            Self::PipeTo { .. } => "PipeTo",
            Self::Read { .. } => "Read",
            Self::SucceedNow { .. } => "SucceedNow",
            Self::Fail { .. } => "Fail",
            Self::Succeed { .. } => "Succeed",
            Self::Suspend { .. } => "Suspend",
            Self::Deferred { .. } => "Deferred",
            Self::Emit { .. } => "Emit",
            Self::AttachCleanup { .. } => "AttachCleanup",
            Self::Concatenate { .. } => "Concatenate",
            Self::Fold { .. } => "Fold",
            Self::Bracket { .. } => "Bracket",
            Self::Provide { .. } => "Provide",
        }
    }
}

impl fmt::Debug for ChannelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelNode::{}", self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_cover_all_variants() {
        assert_eq!(ChannelNode::unit().tag(), "SucceedNow");
        assert_eq!(ChannelNode::emit_value(1_i32).tag(), "Emit");
        assert_eq!(ChannelNode::halt(Cause::Interrupt).tag(), "Fail");
    }

    #[test]
    fn test_flat_map_builds_fold() {
        let node = ChannelNode::unit().flat_map(|_| ChannelNode::emit_value(2_i32));
        assert_eq!(node.tag(), "Fold");
    }
}
