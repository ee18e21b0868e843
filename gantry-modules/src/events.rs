//! Loader telemetry events

use std::cell::RefCell;

/// Kinds of events the engine reports while loading resources and invoking
/// factories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderEventKind {
    /// A resource load was handed to the resource loader.
    BeginLoadingResource,
    /// A resource load finished successfully.
    EndLoadingResourceOk,
    /// A resource load failed.
    EndLoadingResourceError,
    /// A module factory is about to run.
    BeginInvokeFactory,
    /// A module factory returned.
    EndInvokeFactory,
}

/// Sink for loader events. Fire-and-forget: implementations must not block
/// and must not fail.
pub trait EventRecorder {
    /// Record one event with its detail string (a location or module id).
    fn record(&self, kind: LoaderEventKind, detail: &str);
}

/// Recorder that drops every event.
#[derive(Debug, Default)]
pub struct NullEventRecorder;

impl EventRecorder for NullEventRecorder {
    fn record(&self, _kind: LoaderEventKind, _detail: &str) {}
}

/// Recorder that keeps events in memory, in arrival order.
#[derive(Debug, Default)]
pub struct InMemoryEventRecorder {
    events: RefCell<Vec<(LoaderEventKind, String)>>,
}

impl InMemoryEventRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<(LoaderEventKind, String)> {
        self.events.borrow().clone()
    }
}

impl EventRecorder for InMemoryEventRecorder {
    fn record(&self, kind: LoaderEventKind, detail: &str) {
        self.events.borrow_mut().push((kind, detail.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_recorder_keeps_order() {
        let recorder = InMemoryEventRecorder::new();
        recorder.record(LoaderEventKind::BeginLoadingResource, "a.js");
        recorder.record(LoaderEventKind::EndLoadingResourceOk, "a.js");
        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, LoaderEventKind::BeginLoadingResource);
        assert_eq!(events[1].0, LoaderEventKind::EndLoadingResourceOk);
    }
}
