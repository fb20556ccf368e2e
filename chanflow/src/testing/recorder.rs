//! An order-preserving event log shared between test closures.

use crate::node::FinalizerFn;
use crate::outcome::Payload;
use crate::task::Task;
use parking_lot::Mutex;
use std::sync::Arc;

/// Records labelled events from finalizers and effects, preserving order.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn record(&self, label: impl Into<String>) {
        self.events.lock().push(label.into());
    }

    /// A snapshot of the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// A finalizer that records `label` when run.
    #[must_use]
    pub fn finalizer(&self, label: impl Into<String>) -> FinalizerFn {
        let recorder = self.clone();
        let label = label.into();
        Arc::new(move |_| {
            let recorder = recorder.clone();
            let label = label.clone();
            Task::from_fn(move || {
                recorder.record(label);
                Ok(Payload::unit())
            })
        })
    }

    /// A task that records `label` when run.
    #[must_use]
    pub fn task(&self, label: impl Into<String>) -> Task {
        let recorder = self.clone();
        let label = label.into();
        Task::from_fn(move || {
            recorder.record(label);
            Ok(Payload::unit())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recorder_preserves_order() {
        let recorder = Recorder::new();
        recorder.record("a");
        recorder.task("b").await.ok();
        assert_eq!(recorder.events(), vec!["a".to_string(), "b".to_string()]);
    }
}
