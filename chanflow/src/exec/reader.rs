//! The multi-level upstream reader.
//!
//! A `Read` can surface an arbitrarily deep chain of piped executors. The
//! walk here is iterative: each pass finds the deepest executor with a
//! pending read and advances its upstream by one local step, so chain depth
//! never translates into call-stack depth.

use super::{ChannelExecutor, LocalStep, PendingResume, Step, UpstreamHandle};
use crate::bridge::Handoff;
use crate::outcome::Payload;
use crate::task::Task;
use tracing::warn;

enum ChainAction {
    External,
    Handoff(Handoff),
    Upstream(LocalStep),
}

impl ChannelExecutor {
    pub(crate) fn drive(&mut self) -> Step {
        match self.step_chain() {
            LocalStep::Emitted(value) => {
                self.emitted = Some(value.clone());
                Step::Produced(value)
            }
            LocalStep::Done(outcome) => Step::Finished(outcome),
            LocalStep::Suspended(task) => Step::Suspend(task),
            LocalStep::AwaitExternal => Step::NeedsUpstream,
            LocalStep::Continue | LocalStep::AwaitUpstream => {
                warn!("chain walk stopped without an observable step");
                Step::NeedsUpstream
            }
        }
    }

    /// Steps this executor and its upstream chain until something observable
    /// happens: an emission, a terminal outcome, a suspension, or an
    /// unresolved external read.
    pub(crate) fn step_chain(&mut self) -> LocalStep {
        loop {
            if !self.awaiting_upstream() {
                match self.step_local() {
                    LocalStep::Continue | LocalStep::AwaitUpstream => continue,
                    other => return other,
                }
            }
            let reader = self.deepest_awaiting();
            let action = match reader.input {
                None => ChainAction::External,
                Some(UpstreamHandle::Handoff(ref handoff)) => {
                    ChainAction::Handoff(handoff.clone())
                }
                Some(UpstreamHandle::Exec(ref mut upstream)) => {
                    ChainAction::Upstream(upstream.step_local())
                }
            };
            match action {
                ChainAction::External => return LocalStep::AwaitExternal,
                ChainAction::Handoff(handoff) => {
                    reader.pending = Some(PendingResume::HandoffRead);
                    return LocalStep::Suspended(Task::from_future(async move {
                        Ok(Payload::new(handoff.take().await))
                    }));
                }
                ChainAction::Upstream(step) => match step {
                    // The upstream either made silent progress or pushed a
                    // read of its own; the next pass walks deeper.
                    LocalStep::Continue | LocalStep::AwaitUpstream => {}
                    LocalStep::Emitted(value) => reader.apply_read_more(value),
                    LocalStep::Done(outcome) => reader.apply_read_done(outcome),
                    LocalStep::Suspended(task) => return LocalStep::Suspended(task),
                    LocalStep::AwaitExternal => return LocalStep::AwaitExternal,
                },
            }
        }
    }

    /// The deepest executor in the input chain with a pending read whose own
    /// upstream (if any) is not also blocked on a read.
    fn deepest_awaiting(&mut self) -> &mut ChannelExecutor {
        let mut cur: &mut ChannelExecutor = self;
        loop {
            let descend = matches!(
                cur.input,
                Some(UpstreamHandle::Exec(ref up)) if up.awaiting_upstream()
            );
            if !descend {
                return cur;
            }
            cur = match cur.input {
                Some(UpstreamHandle::Exec(ref mut up)) => up,
                _ => unreachable!("descent checked just above"),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ChannelNode;
    use crate::outcome::Outcome;
    use crate::testing::drive_to_end;

    fn take_one() -> ChannelNode {
        ChannelNode::Read {
            on_more: Box::new(ChannelNode::emit),
            on_done: Box::new(|_| ChannelNode::unit()),
        }
    }

    #[tokio::test]
    async fn test_pipe_reads_from_left_executor() {
        let left = ChannelNode::emit_value(10_i32).zip_right(ChannelNode::emit_value(20_i32));
        let node = left.pipe_to(Box::new(take_one));
        let mut exec = ChannelExecutor::new(node);
        let (produced, outcome) = drive_to_end(&mut exec).await;
        let values: Vec<i32> = produced
            .iter()
            .filter_map(|p| p.downcast_ref::<i32>().copied())
            .collect();
        assert_eq!(values, vec![10]);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_two_level_pipe_walks_the_chain() {
        let source = ChannelNode::emit_value(1_i32);
        let middle = source.pipe_to(Box::new(|| ChannelNode::Read {
            on_more: Box::new(|value| {
                let doubled = value.downcast_ref::<i32>().copied().unwrap_or(0) * 2;
                ChannelNode::emit_value(doubled)
            }),
            on_done: Box::new(|_| ChannelNode::unit()),
        }));
        let node = middle.pipe_to(Box::new(take_one));
        let mut exec = ChannelExecutor::new(node);
        let (produced, outcome) = drive_to_end(&mut exec).await;
        let values: Vec<i32> = produced
            .iter()
            .filter_map(|p| p.downcast_ref::<i32>().copied())
            .collect();
        assert_eq!(values, vec![2]);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_deep_pipe_chain_walks_every_level() {
        let mut node = ChannelNode::emit_value(1_i32);
        for _ in 0..32 {
            node = node.pipe_to(Box::new(|| ChannelNode::Read {
                on_more: Box::new(|value| {
                    let n = value.downcast_ref::<i32>().copied().unwrap_or(0);
                    ChannelNode::emit_value(n + 1)
                }),
                on_done: Box::new(|_| ChannelNode::unit()),
            }));
        }
        let mut exec = ChannelExecutor::new(node);
        let (produced, outcome) = drive_to_end(&mut exec).await;
        let values: Vec<i32> = produced
            .iter()
            .filter_map(|p| p.downcast_ref::<i32>().copied())
            .collect();
        assert_eq!(values, vec![33]);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_upstream_done_reaches_reader() {
        let node = ChannelNode::unit().pipe_to(Box::new(|| ChannelNode::Read {
            on_more: Box::new(ChannelNode::emit),
            on_done: Box::new(|outcome: Outcome| {
                ChannelNode::emit_value(i32::from(outcome.is_success()))
            }),
        }));
        let mut exec = ChannelExecutor::new(node);
        let (produced, outcome) = drive_to_end(&mut exec).await;
        let values: Vec<i32> = produced
            .iter()
            .filter_map(|p| p.downcast_ref::<i32>().copied())
            .collect();
        assert_eq!(values, vec![1]);
        assert!(outcome.is_success());
    }
}
