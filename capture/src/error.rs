//! Error types for the capture engine

use aperture_shared::types::target::TargetError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error category reported to listeners and used for metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidTarget,
    AlreadyCapturing,
    NotCapturing,
    ConnectionError,
    TransportError,
    ProtocolViolation,
    DecodeWarning,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::AlreadyCapturing => "already_capturing",
            ErrorKind::NotCapturing => "not_capturing",
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::DecodeWarning => "decode_warning",
        };
        f.write_str(name)
    }
}

/// Errors raised by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused by {0}")]
    Refused(String),

    #[error("connecting to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("remote error: {0}")]
    Remote(String),
}

/// A raw message that could not be decoded consistently with the stream so far.
///
/// Fatal: the session cannot continue once one is observed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("protocol violation in message #{message}: {reason}")]
pub struct ProtocolViolation {
    /// 1-based index of the raw message within the session
    pub message: u64,
    pub reason: String,
}

/// A raw message, or a single event in it, was malformed and skipped. Capture continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("skipped malformed message #{message}: {reason}")]
pub struct DecodeWarning {
    /// 1-based index of the raw message within the session
    pub message: u64,
    pub reason: String,
}

/// Outcome of decoding a raw message that did not yield events
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error(transparent)]
    Malformed(#[from] DecodeWarning),

    #[error(transparent)]
    Violation(#[from] ProtocolViolation),
}

/// Top-level error type for capture control operations
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid capture target: {0}")]
    InvalidTarget(#[from] TargetError),

    #[error("a capture is already in progress")]
    AlreadyCapturing,

    #[error("no capture is in progress")]
    NotCapturing,

    #[error("could not connect to capture service: {0}")]
    Connection(#[source] TransportError),

    #[error("transport failed during capture: {0}")]
    Transport(#[source] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            CaptureError::AlreadyCapturing => ErrorKind::AlreadyCapturing,
            CaptureError::NotCapturing => ErrorKind::NotCapturing,
            CaptureError::Connection(_) => ErrorKind::ConnectionError,
            CaptureError::Transport(_) => ErrorKind::TransportError,
            CaptureError::Protocol(_) => ErrorKind::ProtocolViolation,
        }
    }
}
