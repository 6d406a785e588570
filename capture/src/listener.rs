//! Listener contract between the capture engine and its consumers

use crate::error::{DecodeWarning, ErrorKind};
use aperture_shared::types::events::DomainEvent;
use std::sync::Mutex;

/// Receives the progress of capture sessions.
///
/// All callbacks for a session are made from that session's background task,
/// strictly in receive order, so implementations never race with themselves.
/// For every session that reached the background task exactly one of
/// [`on_finished`](Self::on_finished) or [`on_error`](Self::on_error) is called,
/// and nothing is delivered after it.
///
/// Callbacks must return promptly: the engine has no timeout protection against
/// a slow listener, and a blocked callback stalls the receive loop.
pub trait CaptureListener: Send + Sync {
    /// The service answered the start request
    fn on_started(&self);

    /// Decoded events from one raw message (never empty)
    fn on_events(&self, events: Vec<DomainEvent>);

    /// The session ended. `truncated` is set unless a clean end-of-stream
    /// followed the stop request.
    fn on_finished(&self, truncated: bool);

    /// The session failed mid-capture
    fn on_error(&self, kind: ErrorKind, message: &str);

    /// A malformed message or single event was skipped; capture continues
    fn on_warning(&self, _warning: &DecodeWarning) {}
}

/// One listener callback, as recorded by [`RecordingListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerCall {
    Started,
    Events(Vec<DomainEvent>),
    Finished { truncated: bool },
    Error { kind: ErrorKind, message: String },
    Warning(DecodeWarning),
}

/// Listener that keeps every callback in order.
///
/// Useful to embed the engine without a UI and in tests.
#[derive(Debug, Default)]
pub struct RecordingListener {
    calls: Mutex<Vec<ListenerCall>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all callbacks received so far
    pub fn calls(&self) -> Vec<ListenerCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// All delivered events, flattened across batches
    pub fn events(&self) -> Vec<DomainEvent> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ListenerCall::Events(events) => Some(events),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Number of `on_finished` plus `on_error` callbacks
    pub fn terminal_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ListenerCall::Finished { .. } | ListenerCall::Error { .. }))
            .count()
    }

    fn record(&self, call: ListenerCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl CaptureListener for RecordingListener {
    fn on_started(&self) {
        self.record(ListenerCall::Started);
    }

    fn on_events(&self, events: Vec<DomainEvent>) {
        self.record(ListenerCall::Events(events));
    }

    fn on_finished(&self, truncated: bool) {
        self.record(ListenerCall::Finished { truncated });
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.record(ListenerCall::Error {
            kind,
            message: message.to_string(),
        });
    }

    fn on_warning(&self, warning: &DecodeWarning) {
        self.record(ListenerCall::Warning(warning.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_shared::types::events::ThreadName;

    #[test]
    fn test_recording_listener_keeps_order() {
        let listener = RecordingListener::new();
        let event = DomainEvent::ThreadName(ThreadName {
            timestamp: 1,
            pid: 42,
            tid: 7,
            name: "main".to_string(),
        });

        listener.on_started();
        listener.on_events(vec![event.clone()]);
        listener.on_warning(&DecodeWarning {
            message: 2,
            reason: "bad".to_string(),
        });
        listener.on_finished(true);

        let calls = listener.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], ListenerCall::Started);
        assert_eq!(calls[3], ListenerCall::Finished { truncated: true });
        assert_eq!(listener.events(), vec![event]);
        assert_eq!(listener.terminal_count(), 1);
    }
}
