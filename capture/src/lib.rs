//! Aperture Capture Session Engine
//!
//! This library drives capture sessions against a remote capture service:
//! starting and stopping captures, receiving the raw event stream on a
//! background task, decoding it into domain events and delivering them to a
//! [`CaptureListener`].

pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod session;
pub mod transport;

pub use client::CaptureClient;
pub use config::CaptureOptions;
pub use error::{CaptureError, DecodeWarning, ErrorKind, ProtocolViolation, TransportError};
pub use listener::{CaptureListener, ListenerCall, RecordingListener};
pub use processor::{EventProcessor, Processed, RawEvent};
pub use session::{CaptureState, SessionId, SessionOutcome, SessionReport, TruncationCause};
