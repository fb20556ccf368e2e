//! Pull-policy and child-decision tables for nested concatenation.
//!
//! Policies are closures consulted by the driver; the engine supplies the
//! mechanism (when to pull, where separators land) and the policy supplies the
//! decision.

use crate::outcome::Payload;
use std::sync::Arc;

/// What the concatenation frame is asking the pull policy about.
#[derive(Debug)]
pub enum PullRequest<'a> {
    /// Upstream just emitted a value.
    Pulled(&'a Payload),
    /// Upstream is exhausted; `active_children` children remain queued.
    NoUpstream {
        /// Number of children still queued behind the current one.
        active_children: usize,
    },
}

/// Governs batching of child creation relative to upstream pulls.
///
/// Only the two observable variants exist; additional variants are an open
/// design point, not something to infer.
#[derive(Clone, Debug)]
pub enum PullPolicy {
    /// Run the new child immediately; pull upstream again after it pauses or
    /// finishes. Optionally emits `separator` between batches.
    PullAfterNext {
        /// Value emitted between batches, if any.
        separator: Option<Payload>,
    },
    /// Enqueue the new child and keep pulling until upstream is exhausted,
    /// then drain children in order. Optionally emits `separator` between
    /// batches.
    PullAfterAllEnqueued {
        /// Value emitted between batches, if any.
        separator: Option<Payload>,
    },
}

impl PullPolicy {
    /// Extracts the separator, whichever variant this is.
    #[must_use]
    pub fn separator(&self) -> Option<&Payload> {
        match self {
            Self::PullAfterNext { separator } | Self::PullAfterAllEnqueued { separator } => {
                separator.as_ref()
            }
        }
    }
}

/// Maps a pull request to a pull policy.
pub type PullPolicyFn = Arc<dyn Fn(PullRequest<'_>) -> PullPolicy + Send + Sync>;

/// Per-emission verdict for an active child.
#[derive(Clone, Debug)]
pub enum ChildDecision {
    /// Keep reading this child.
    Continue,
    /// Re-enqueue this child and move on (round-robin fairness).
    Yield,
    /// Finish this child early; merge the payload into the parent result.
    Close(Payload),
}

/// Maps a child emission to a decision.
pub type EmitDecisionFn = Arc<dyn Fn(&Payload) -> ChildDecision + Send + Sync>;

/// The default, sequential pull policy: pull after each emission, no
/// separators.
#[must_use]
pub fn pull_after_next() -> PullPolicyFn {
    Arc::new(|_| PullPolicy::PullAfterNext { separator: None })
}

/// Gathers every child before draining any, no separators.
#[must_use]
pub fn pull_after_all_enqueued() -> PullPolicyFn {
    Arc::new(|_| PullPolicy::PullAfterAllEnqueued { separator: None })
}

/// The default child decision: always continue.
#[must_use]
pub fn continue_all() -> EmitDecisionFn {
    Arc::new(|_| ChildDecision::Continue)
}

/// Yields after every child emission (breadth-first interleaving).
#[must_use]
pub fn yield_each() -> EmitDecisionFn {
    Arc::new(|_| ChildDecision::Yield)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_pull_after_next() {
        let policy = pull_after_next();
        let value = Payload::unit();
        match policy(PullRequest::Pulled(&value)) {
            PullPolicy::PullAfterNext { separator } => assert!(separator.is_none()),
            other => panic!("unexpected policy {other:?}"),
        }
    }

    #[test]
    fn test_separator_accessor() {
        let policy = PullPolicy::PullAfterAllEnqueued {
            separator: Some(Payload::new(0_i32)),
        };
        assert!(policy.separator().is_some());
    }
}
