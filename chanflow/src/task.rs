//! Deferred computations handed to the host task substrate.
//!
//! The engine itself never blocks: anything asynchronous is packaged as a
//! [`Task`] inside a [`crate::Step::Suspend`] and awaited by the external
//! scheduler. Panics inside a task are captured and converted into
//! [`Cause::Die`] so no raw panic ever escapes a `step()` boundary.

use crate::outcome::{Cause, Payload};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// The result of running a deferred computation.
pub type TaskResult = Result<Payload, Cause>;

/// A boxed deferred computation to be run by the host scheduler.
///
/// Uninterruptible tasks (finalizer batches, bracket acquisition, close
/// batches) must be driven to completion before the host observes any further
/// cancellation.
pub struct Task {
    future: BoxFuture<'static, TaskResult>,
    uninterruptible: bool,
}

impl Task {
    /// Wraps a future, shielding the caller from panics inside it.
    #[must_use]
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let shielded = std::panic::AssertUnwindSafe(future)
            .catch_unwind()
            .map(|result| match result {
                Ok(inner) => inner,
                Err(panic) => Err(Cause::from_panic(panic)),
            });
        Self {
            future: Box::pin(shielded),
            uninterruptible: false,
        }
    }

    /// Wraps a synchronous computation.
    #[must_use]
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        Self::from_future(async move { f() })
    }

    /// A task that immediately succeeds with `payload`.
    #[must_use]
    pub fn succeed(payload: Payload) -> Self {
        Self::from_future(async move { Ok(payload) })
    }

    /// A task that immediately succeeds with unit.
    #[must_use]
    pub fn unit() -> Self {
        Self::succeed(Payload::unit())
    }

    /// A task that immediately fails with `cause`.
    #[must_use]
    pub fn fail(cause: Cause) -> Self {
        Self::from_future(async move { Err(cause) })
    }

    /// Marks the task as uninterruptible.
    #[must_use]
    pub fn uninterruptible(mut self) -> Self {
        self.uninterruptible = true;
        self
    }

    /// Returns true if the host must run this task to completion.
    #[must_use]
    pub fn is_uninterruptible(&self) -> bool {
        self.uninterruptible
    }

    /// Sequences `next` after this task, short-circuiting on failure.
    #[must_use]
    pub fn and_then(self, next: Self) -> Self {
        let uninterruptible = self.uninterruptible || next.uninterruptible;
        let task = Self::from_future(async move {
            let payload = self.await?;
            drop(payload);
            next.await
        });
        if uninterruptible {
            task.uninterruptible()
        } else {
            task
        }
    }

    /// Folds the task result, success and failure alike.
    #[must_use]
    pub fn fold<F>(self, f: F) -> Self
    where
        F: FnOnce(TaskResult) -> TaskResult + Send + 'static,
    {
        let uninterruptible = self.uninterruptible;
        let task = Self::from_future(async move { f(self.await) });
        if uninterruptible {
            task.uninterruptible()
        } else {
            task
        }
    }
}

impl Future for Task {
    type Output = TaskResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().future.as_mut().poll(cx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("uninterruptible", &self.uninterruptible)
            .finish()
    }
}

/// Runs every task in order, never short-circuiting.
///
/// Failures are combined sequentially via [`Cause::then`]; the whole batch is
/// uninterruptible.
#[must_use]
pub fn run_sequenced(tasks: Vec<Task>) -> Task {
    Task::from_future(async move {
        let mut combined: Option<Cause> = None;
        for task in tasks {
            if let Err(cause) = task.await {
                combined = Some(match combined {
                    None => cause,
                    Some(previous) => previous.then(cause),
                });
            }
        }
        match combined {
            None => Ok(Payload::unit()),
            Some(cause) => Err(cause),
        }
    })
    .uninterruptible()
}

/// Runs sibling tasks to completion, combining failures via [`Cause::both`].
///
/// True parallelism is the host's concern; the engine only preserves the
/// parallel shape of the combined cause.
#[must_use]
pub fn run_gathered(tasks: Vec<Task>) -> Task {
    Task::from_future(async move {
        let mut combined: Option<Cause> = None;
        for task in tasks {
            if let Err(cause) = task.await {
                combined = Some(match combined {
                    None => cause,
                    Some(previous) => previous.both(cause),
                });
            }
        }
        match combined {
            None => Ok(Payload::unit()),
            Some(cause) => Err(cause),
        }
    })
    .uninterruptible()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;

    #[tokio::test]
    async fn test_from_fn_success() {
        let task = Task::from_fn(|| Ok(Payload::new(7_i32)));
        let result = task.await;
        assert_eq!(result.ok().and_then(|p| p.downcast_ref::<i32>().copied()), Some(7));
    }

    #[tokio::test]
    async fn test_panic_becomes_die() {
        let task = Task::from_fn(|| panic!("kaboom"));
        match task.await {
            Err(Cause::Die(payload)) => {
                assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("kaboom"));
            }
            other => panic!("expected Die, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_sequenced_never_short_circuits() {
        let tasks = vec![
            Task::fail(Cause::fail("first")),
            Task::unit(),
            Task::fail(Cause::fail("second")),
        ];
        match run_sequenced(tasks).await {
            Err(Cause::Then(left, right)) => {
                assert!(matches!(*left, Cause::Fail(_)));
                assert!(matches!(*right, Cause::Fail(_)));
            }
            other => panic!("expected Then, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_gathered_combines_with_both() {
        let tasks = vec![Task::fail(Cause::fail("a")), Task::fail(Cause::fail("b"))];
        assert!(matches!(run_gathered(tasks).await, Err(Cause::Both(_, _))));
    }

    #[tokio::test]
    async fn test_and_then_short_circuits() {
        let task = Task::fail(Cause::Interrupt).and_then(Task::succeed(Payload::new(1_i32)));
        assert!(matches!(task.await, Err(Cause::Interrupt)));
    }

    #[tokio::test]
    async fn test_fold_recovers_failure() {
        let task = Task::fail(Cause::fail("oops")).fold(|result| match result {
            Ok(payload) => Ok(payload),
            Err(_) => Ok(Payload::unit()),
        });
        let outcome = match task.await {
            Ok(payload) => Outcome::Success(payload),
            Err(cause) => Outcome::Failure(cause),
        };
        assert!(outcome.is_success());
    }
}
