//! Capture session state machine and background receive loop
//!
//! A session is driven by exactly one [`SessionTask`]. The task owns the
//! transport and the event processor, and is the only caller of the listener.
//! The controller and the task share a [`SessionCell`] behind one mutex; every
//! state transition goes through it.

use crate::error::{CaptureError, DecodeWarning, ErrorKind, ProcessError};
use crate::listener::CaptureListener;
use crate::metrics;
use crate::processor::{EventProcessor, RawEvent};
use crate::transport::Transport;
use aperture_shared::types::events::DomainEvent;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifier of a capture session, unique per controller
pub type SessionId = u64;

/// Lifecycle state of the controller's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Starting,
    Capturing,
    Stopping,
    Finished,
    Error,
}

impl CaptureState {
    fn can_transition_to(self, to: CaptureState) -> bool {
        use CaptureState::*;
        matches!(
            (self, to),
            (Idle, Starting)
                | (Starting, Idle)
                | (Starting, Capturing)
                | (Starting | Capturing, Stopping)
                | (Starting | Capturing | Stopping, Finished)
                | (Starting | Capturing | Stopping, Error)
                | (Finished | Error, Idle)
        )
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a session finished without a clean end-of-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationCause {
    /// The service did not end the stream within the drain timeout
    DrainTimeout,
    /// The service ended the stream before stop was requested
    UnexpectedEndOfStream,
    /// The controller was dropped while the session was running
    Aborted,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Truncated(TruncationCause),
    Failed { kind: ErrorKind, message: String },
}

impl SessionOutcome {
    /// Metrics label
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Truncated(_) => "truncated",
            SessionOutcome::Failed { .. } => "failed",
        }
    }
}

/// Summary of a finished session, returned at the join point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub outcome: SessionOutcome,
    pub raw_messages: u64,
    pub domain_events: u64,
    pub decode_warnings: u64,
    pub sequence_gaps: u64,
    pub elapsed: Duration,
}

impl SessionReport {
    pub fn truncated(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Truncated(_))
    }
}

/// State shared by the controller and the session task
#[derive(Debug, Default)]
pub(crate) struct SessionCell {
    state: CaptureState,
    session_id: SessionId,
    /// Cancelled by the controller to request a graceful stop
    stop: Option<CancellationToken>,
    /// First mid-session error; never overwritten
    error: Option<(ErrorKind, String)>,
    last_report: Option<SessionReport>,
}

impl SessionCell {
    pub(crate) fn state(&self) -> CaptureState {
        self.state
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub(crate) fn last_report(&self) -> Option<SessionReport> {
        self.last_report.clone()
    }

    pub(crate) fn error(&self) -> Option<(ErrorKind, String)> {
        self.error.clone()
    }

    pub(crate) fn transition(&mut self, to: CaptureState) -> bool {
        if !self.state.can_transition_to(to) {
            warn!(
                session = self.session_id,
                from = %self.state,
                to = %to,
                "Ignoring invalid capture state transition"
            );
            return false;
        }
        debug!(session = self.session_id, from = %self.state, to = %to, "Capture state transition");
        self.state = to;
        true
    }

    /// Idle -> Starting for a new session. Returns its id and stop token.
    pub(crate) fn begin(&mut self) -> (SessionId, CancellationToken) {
        self.session_id += 1;
        self.transition(CaptureState::Starting);
        self.error = None;
        let stop = CancellationToken::new();
        self.stop = Some(stop.clone());
        (self.session_id, stop)
    }

    /// Request a graceful stop. Returns false if one was already requested.
    pub(crate) fn request_stop(&mut self) -> bool {
        if !self.transition(CaptureState::Stopping) {
            return false;
        }
        if let Some(stop) = &self.stop {
            stop.cancel();
        }
        true
    }

    /// A start that never reached the session task goes back to Idle
    pub(crate) fn abandon_start(&mut self) {
        debug!(session = self.session_id, from = %self.state, "Capture start abandoned");
        self.state = CaptureState::Idle;
        self.stop = None;
    }

    fn record_error(&mut self, kind: ErrorKind, message: &str) {
        if self.error.is_none() {
            self.error = Some((kind, message.to_string()));
        }
    }

    fn reset(&mut self, report: SessionReport) {
        self.transition(CaptureState::Idle);
        self.stop = None;
        self.last_report = Some(report);
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum SessionEnd {
    EndOfStream { stop_requested: bool },
    DrainTimeout,
    Aborted,
    Failed(CaptureError),
}

/// Background task driving one capture session
pub(crate) struct SessionTask {
    id: SessionId,
    cell: Arc<Mutex<SessionCell>>,
    transport: Box<dyn Transport>,
    processor: EventProcessor,
    listener: Arc<dyn CaptureListener>,
    stop: CancellationToken,
    abort: CancellationToken,
    drain_timeout: Duration,
    started: bool,
    domain_events: u64,
    decode_warnings: u64,
    started_at: Instant,
}

impl SessionTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        cell: Arc<Mutex<SessionCell>>,
        transport: Box<dyn Transport>,
        processor: EventProcessor,
        listener: Arc<dyn CaptureListener>,
        stop: CancellationToken,
        abort: CancellationToken,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            id,
            cell,
            transport,
            processor,
            listener,
            stop,
            abort,
            drain_timeout,
            started: false,
            domain_events: 0,
            decode_warnings: 0,
            started_at: Instant::now(),
        }
    }

    /// Receive until the stream ends, then finalize. Always returns a report and
    /// always leaves the shared cell Idle.
    pub(crate) async fn run(mut self) -> SessionReport {
        let mut drain_started: Option<Instant> = None;
        let mut drain_deadline = Instant::now();

        let end = loop {
            tokio::select! {
                biased;

                _ = self.abort.cancelled() => break SessionEnd::Aborted,

                _ = self.stop.cancelled(), if drain_started.is_none() => {
                    info!(session = self.id, "Stop requested, draining capture stream");
                    if let Err(e) = self.transport.half_close().await {
                        break SessionEnd::Failed(CaptureError::Transport(e));
                    }
                    let now = Instant::now();
                    drain_started = Some(now);
                    drain_deadline = now + self.drain_timeout;
                }

                _ = tokio::time::sleep_until(drain_deadline), if drain_started.is_some() => {
                    break SessionEnd::DrainTimeout;
                }

                received = self.transport.receive() => match received {
                    Ok(Some(raw)) => {
                        if let Err(e) = self.handle(raw) {
                            break SessionEnd::Failed(e);
                        }
                    }
                    Ok(None) => break SessionEnd::EndOfStream {
                        stop_requested: drain_started.is_some(),
                    },
                    Err(e) => break SessionEnd::Failed(CaptureError::Transport(e)),
                },
            }
        };

        if let Some(started) = drain_started {
            metrics::DRAIN_DURATION.observe(started.elapsed().as_secs_f64());
        }
        self.finish(end).await
    }

    fn handle(&mut self, raw: RawEvent) -> Result<(), CaptureError> {
        metrics::RAW_MESSAGES_TOTAL.inc();

        if !self.started {
            self.started = true;
            {
                let mut cell = lock(&self.cell);
                if cell.state() == CaptureState::Starting {
                    cell.transition(CaptureState::Capturing);
                }
            }
            info!(session = self.id, "Capture started");
            self.listener.on_started();
        }

        let gaps_before = self.processor.sequence_gaps();
        let result = self.processor.process(raw);
        let new_gaps = self.processor.sequence_gaps() - gaps_before;
        if new_gaps > 0 {
            metrics::SEQUENCE_GAPS_TOTAL.inc_by(new_gaps as f64);
        }

        match result {
            Ok(processed) => {
                for warning in &processed.skipped {
                    self.warn_skipped(warning);
                }
                self.deliver(processed.events);
            }
            Err(ProcessError::Malformed(warning)) => self.warn_skipped(&warning),
            Err(ProcessError::Violation(violation)) => return Err(violation.into()),
        }
        Ok(())
    }

    fn warn_skipped(&mut self, warning: &DecodeWarning) {
        self.decode_warnings += 1;
        metrics::DECODE_WARNINGS_TOTAL.inc();
        warn!(session = self.id, "{}", warning);
        self.listener.on_warning(warning);
    }

    fn deliver(&mut self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }
        self.domain_events += events.len() as u64;
        metrics::DOMAIN_EVENTS_TOTAL.inc_by(events.len() as f64);
        self.listener.on_events(events);
    }

    async fn finish(mut self, end: SessionEnd) -> SessionReport {
        let outcome = match end {
            SessionEnd::EndOfStream {
                stop_requested: true,
            } => SessionOutcome::Completed,
            SessionEnd::EndOfStream {
                stop_requested: false,
            } => {
                warn!(
                    session = self.id,
                    "Capture service ended the stream before stop was requested"
                );
                SessionOutcome::Truncated(TruncationCause::UnexpectedEndOfStream)
            }
            SessionEnd::DrainTimeout => {
                warn!(
                    session = self.id,
                    timeout = ?self.drain_timeout,
                    "Capture stream not closed within drain timeout, cancelling"
                );
                self.transport.cancel().await;
                SessionOutcome::Truncated(TruncationCause::DrainTimeout)
            }
            SessionEnd::Aborted => {
                debug!(session = self.id, "Capture client dropped, cancelling stream");
                self.transport.cancel().await;
                SessionOutcome::Truncated(TruncationCause::Aborted)
            }
            SessionEnd::Failed(e) => {
                warn!(session = self.id, "Capture failed: {}", e);
                self.transport.cancel().await;
                SessionOutcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };

        {
            let mut cell = lock(&self.cell);
            match &outcome {
                SessionOutcome::Failed { kind, message } => {
                    cell.record_error(*kind, message);
                    cell.transition(CaptureState::Error);
                }
                _ => {
                    cell.transition(CaptureState::Finished);
                }
            }
        }

        let SessionTask {
            id,
            cell,
            transport,
            processor,
            listener,
            mut domain_events,
            decode_warnings,
            started_at,
            ..
        } = self;

        let raw_messages = processor.messages();
        let sequence_gaps = processor.sequence_gaps();
        let tail = processor.finalize();
        if !tail.is_empty() {
            domain_events += tail.len() as u64;
            metrics::DOMAIN_EVENTS_TOTAL.inc_by(tail.len() as f64);
            listener.on_events(tail);
        }

        match &outcome {
            SessionOutcome::Completed => listener.on_finished(false),
            SessionOutcome::Truncated(_) => listener.on_finished(true),
            SessionOutcome::Failed { kind, message } => listener.on_error(*kind, message),
        }
        drop(transport);
        metrics::SESSIONS_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();

        let report = SessionReport {
            session_id: id,
            outcome,
            raw_messages,
            domain_events,
            decode_warnings,
            sequence_gaps,
            elapsed: started_at.elapsed(),
        };
        info!(
            session = id,
            outcome = report.outcome.label(),
            raw_messages,
            domain_events,
            decode_warnings,
            "Capture session finished"
        );

        lock(&cell).reset(report.clone());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use CaptureState::*;
        assert!(Idle.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Capturing));
        assert!(Capturing.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Finished));
        assert!(Capturing.can_transition_to(Error));
        assert!(Finished.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Stopping));
        assert!(!Stopping.can_transition_to(Stopping));
        assert!(!Finished.can_transition_to(Capturing));
        assert!(!Idle.can_transition_to(Error));
    }

    #[test]
    fn test_stop_requested_once() {
        let mut cell = SessionCell::default();
        let (id, stop) = cell.begin();
        assert_eq!(id, 1);
        assert_eq!(cell.state(), CaptureState::Starting);

        assert!(cell.request_stop());
        assert!(stop.is_cancelled());
        assert!(!cell.request_stop());
        assert_eq!(cell.state(), CaptureState::Stopping);
    }

    #[test]
    fn test_error_slot_set_once() {
        let mut cell = SessionCell::default();
        cell.begin();
        cell.record_error(ErrorKind::TransportError, "first");
        cell.record_error(ErrorKind::ProtocolViolation, "second");
        assert_eq!(
            cell.error(),
            Some((ErrorKind::TransportError, "first".to_string()))
        );

        // A new session clears the slot
        cell.abandon_start();
        cell.begin();
        assert_eq!(cell.error(), None);
        assert_eq!(cell.session_id(), 2);
    }
}
