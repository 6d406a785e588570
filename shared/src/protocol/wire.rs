//! Wire protocol for client-service capture streams.
//!
//! Uses bincode with an explicit config so client and service always use the same
//! encoding (fixint for lengths and enums), avoiding version/skew mismatches.
//!
//! A capture stream is one `CaptureRequest::Start` from the client, followed by
//! any number of `CaptureResponse` messages from the service. Stopping is not a
//! message: the client half-closes its send direction and the service ends the
//! response stream once it has flushed what it still holds.
//!
//! Responses reference strings and callstacks by interned key. The key must have
//! been announced (by an `InternedString` / `InternedCallstack` event) in the same
//! or an earlier response of the stream.

use crate::types::events::{CpuId, FunctionId, Pid, StackTrace, Tid, Timestamp};
use crate::types::target::CaptureTarget;
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Single bincode config for wire format: fixint encoding so vec lengths and enum tags
/// have a fixed size and cannot be misinterpreted across builds or bincode versions.
fn wire_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("unsupported protocol version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

// ---------------------------------------------------------------------------
// Client -> service
// ---------------------------------------------------------------------------

/// One function selected for instrumentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentedFunction {
    pub address: FunctionId,
    pub size: u64,
    pub name: String,
    pub module_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCaptureRequest {
    pub version: u32,
    /// Free-form identifier of the requesting client (usually the hostname)
    pub client_id: String,
    pub pid: Pid,
    pub sampling_rate_hz: u64,
    pub functions: Vec<InstrumentedFunction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureRequest {
    Start(StartCaptureRequest),
}

impl CaptureRequest {
    /// Build the start request for `target`, selecting functions in address order.
    pub fn start(target: &CaptureTarget, client_id: &str, sampling_rate_hz: u64) -> Self {
        let functions = target
            .functions
            .iter()
            .map(|(address, info)| InstrumentedFunction {
                address: *address,
                size: info.size,
                name: info.name.clone(),
                module_path: info.module_path.clone(),
            })
            .collect();

        CaptureRequest::Start(StartCaptureRequest {
            version: PROTOCOL_VERSION,
            client_id: client_id.to_string(),
            pid: target.pid,
            sampling_rate_hz,
            functions,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        wire_bincode().serialize(self).map_err(WireError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let request: Self = wire_bincode()
            .deserialize(bytes)
            .map_err(WireError::Decode)?;
        let CaptureRequest::Start(start) = &request;
        if start.version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion {
                found: start.version,
                expected: PROTOCOL_VERSION,
            });
        }
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// Service -> client
// ---------------------------------------------------------------------------

/// Undecoded-to-domain event as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureEvent {
    InternedString {
        key: u64,
        value: String,
    },
    InternedCallstack {
        key: u64,
        frames: StackTrace,
    },
    CallstackSample {
        timestamp_ns: Timestamp,
        pid: Pid,
        tid: Tid,
        callstack_key: u64,
    },
    SchedulingSlice {
        pid: Pid,
        tid: Tid,
        core: CpuId,
        in_timestamp_ns: Timestamp,
        out_timestamp_ns: Timestamp,
    },
    FunctionEntry {
        tid: Tid,
        function_id: FunctionId,
        timestamp_ns: Timestamp,
    },
    FunctionExit {
        tid: Tid,
        function_id: FunctionId,
        timestamp_ns: Timestamp,
    },
    ThreadName {
        pid: Pid,
        tid: Tid,
        name_key: u64,
        timestamp_ns: Timestamp,
    },
}

/// Wire message envelope for one service response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub version: u32,
    /// Service-side sequence number, starting at 1 and incremented per response
    pub sequence: u64,
    pub events: Vec<CaptureEvent>,
}

impl CaptureResponse {
    /// Create a new response
    pub fn new(sequence: u64, events: Vec<CaptureEvent>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            events,
        }
    }

    /// Serialize response to bytes (bincode, fixint encoding).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        wire_bincode().serialize(self).map_err(WireError::Encode)
    }

    /// Deserialize response from bytes, validating the protocol version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let response: Self = wire_bincode()
            .deserialize(bytes)
            .map_err(WireError::Decode)?;
        if response.version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion {
                found: response.version,
                expected: PROTOCOL_VERSION,
            });
        }
        Ok(response)
    }
}
