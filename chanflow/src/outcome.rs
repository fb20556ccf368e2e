//! Terminal outcomes and structured failure causes.
//!
//! Values crossing the interpreter boundary are type-erased into [`Payload`]
//! so the hot loop stays monomorphic; strong typing is re-established at the
//! facade via the downcast helpers.

use crate::errors::EngineError;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A type-erased, cheaply cloneable value flowing through a channel.
///
/// The original type name is captured at construction for diagnostics.
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    /// Erases a value into a payload.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// The unit payload.
    #[must_use]
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Returns the type name captured when the payload was created.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns true if the payload holds a value of type `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrows the payload as `T`, if it holds one.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Borrows the payload as `T`, reporting the actual type on mismatch.
    pub fn downcast<T: Any>(&self) -> Result<&T, EngineError> {
        self.value
            .downcast_ref::<T>()
            .ok_or_else(|| EngineError::PayloadType {
                expected: std::any::type_name::<T>(),
                actual: self.type_name,
            })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload<{}>", self.type_name)
    }
}

/// Structured, combinable failure representation.
///
/// Typed failures, defects (unexpected panics) and interruption are kept
/// distinct; sequential (`Then`) and parallel (`Both`) composition ensures
/// concurrent finalizer failures are never silently dropped.
#[derive(Clone, Debug)]
pub enum Cause {
    /// A recoverable, typed failure.
    Fail(Payload),
    /// An unrecoverable defect, typically a captured panic.
    Die(Payload),
    /// Cooperative interruption.
    Interrupt,
    /// Two causes that occurred one after the other.
    Then(Box<Cause>, Box<Cause>),
    /// Two causes that occurred concurrently.
    Both(Box<Cause>, Box<Cause>),
}

impl Cause {
    /// Creates a typed failure cause.
    #[must_use]
    pub fn fail<T: Any + Send + Sync>(error: T) -> Self {
        Self::Fail(Payload::new(error))
    }

    /// Creates a defect cause from a message.
    #[must_use]
    pub fn die(message: impl Into<String>) -> Self {
        Self::Die(Payload::new(message.into()))
    }

    /// Converts a captured panic payload into a defect cause.
    #[must_use]
    pub fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        Self::die(message)
    }

    /// Sequentially composes two causes.
    #[must_use]
    pub fn then(self, second: Self) -> Self {
        Self::Then(Box::new(self), Box::new(second))
    }

    /// Composes two causes that occurred in parallel.
    #[must_use]
    pub fn both(self, second: Self) -> Self {
        Self::Both(Box::new(self), Box::new(second))
    }

    /// Returns true if interruption appears anywhere in the cause tree.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupt => true,
            Self::Fail(_) | Self::Die(_) => false,
            Self::Then(left, right) | Self::Both(left, right) => {
                left.is_interrupted() || right.is_interrupted()
            }
        }
    }

    /// Collects every typed failure in the cause tree, left to right.
    #[must_use]
    pub fn failures(&self) -> Vec<&Payload> {
        let mut acc = Vec::new();
        self.collect_failures(&mut acc);
        acc
    }

    /// Collects every defect in the cause tree, left to right.
    #[must_use]
    pub fn defects(&self) -> Vec<&Payload> {
        let mut acc = Vec::new();
        self.collect_defects(&mut acc);
        acc
    }

    fn collect_failures<'a>(&'a self, acc: &mut Vec<&'a Payload>) {
        match self {
            Self::Fail(payload) => acc.push(payload),
            Self::Die(_) | Self::Interrupt => {}
            Self::Then(left, right) | Self::Both(left, right) => {
                left.collect_failures(acc);
                right.collect_failures(acc);
            }
        }
    }

    fn collect_defects<'a>(&'a self, acc: &mut Vec<&'a Payload>) {
        match self {
            Self::Die(payload) => acc.push(payload),
            Self::Fail(_) | Self::Interrupt => {}
            Self::Then(left, right) | Self::Both(left, right) => {
                left.collect_defects(acc);
                right.collect_defects(acc);
            }
        }
    }
}

/// The terminal result of a channel: a success value or a failure cause.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// The channel completed with a value.
    Success(Payload),
    /// The channel failed, was interrupted, or died.
    Failure(Cause),
}

impl Outcome {
    /// The unit success outcome.
    #[must_use]
    pub fn unit() -> Self {
        Self::Success(Payload::unit())
    }

    /// Creates an interrupted outcome.
    #[must_use]
    pub fn interrupted() -> Self {
        Self::Failure(Cause::Interrupt)
    }

    /// Returns true if the outcome is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns true if the outcome is a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Borrows the success payload, if any.
    #[must_use]
    pub fn success(&self) -> Option<&Payload> {
        match self {
            Self::Success(payload) => Some(payload),
            Self::Failure(_) => None,
        }
    }

    /// Borrows the failure cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// Folds a finalizer failure into this outcome.
    ///
    /// The original cause is never discarded: a failing outcome gains the
    /// finalizer cause sequentially, a successful one becomes a failure.
    #[must_use]
    pub fn with_finalizer_failure(self, cause: Cause) -> Self {
        match self {
            Self::Success(_) => Self::Failure(cause),
            Self::Failure(original) => Self::Failure(original.then(cause)),
        }
    }
}
