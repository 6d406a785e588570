//! Domain event definitions for capture data
//!
//! These types are what the capture engine hands to listeners once raw wire
//! messages have been decoded. They are self-contained: interned strings and
//! callstacks are already resolved.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in nanoseconds, as reported by the capture service
pub type Timestamp = u64;

/// Process ID
pub type Pid = i32;

/// Thread ID
pub type Tid = i32;

/// CPU core number
pub type CpuId = u32;

/// Stack trace represented as an array of instruction pointers
pub type StackTrace = Vec<u64>;

/// Stable identifier of an instrumented function (its absolute address)
pub type FunctionId = u64;

/// Callstack sample taken on a thread of the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallstackSample {
    /// Timestamp when the sample was taken
    pub timestamp: Timestamp,

    /// Process ID
    pub pid: Pid,

    /// Thread ID
    pub tid: Tid,

    /// Sampled frames, innermost first
    pub frames: StackTrace,
}

/// Interval during which a thread was scheduled on a core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingSlice {
    pub pid: Pid,
    pub tid: Tid,
    pub core: CpuId,
    pub start: Timestamp,
    pub end: Timestamp,
}

/// One invocation of an instrumented function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub tid: Tid,
    pub function_id: FunctionId,
    pub begin: Timestamp,
    pub end: Timestamp,

    /// Nesting depth on the calling thread (0 = outermost instrumented call)
    pub depth: u32,

    /// Set when the session ended before the matching exit was observed;
    /// `end` is then the last timestamp seen in the session.
    #[serde(default)]
    pub truncated: bool,
}

/// Thread name reported by the capture service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadName {
    pub timestamp: Timestamp,
    pub pid: Pid,
    pub tid: Tid,
    pub name: String,
}

/// Unified decoded capture event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
    Sample(CallstackSample),
    SchedulingSlice(SchedulingSlice),
    FunctionCall(FunctionCall),
    ThreadName(ThreadName),
}

impl DomainEvent {
    /// Get the timestamp of any event type.
    ///
    /// Slices and calls report their start.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            DomainEvent::Sample(e) => e.timestamp,
            DomainEvent::SchedulingSlice(e) => e.start,
            DomainEvent::FunctionCall(e) => e.begin,
            DomainEvent::ThreadName(e) => e.timestamp,
        }
    }

    /// Get the thread ID of any event type
    pub fn tid(&self) -> Tid {
        match self {
            DomainEvent::Sample(e) => e.tid,
            DomainEvent::SchedulingSlice(e) => e.tid,
            DomainEvent::FunctionCall(e) => e.tid,
            DomainEvent::ThreadName(e) => e.tid,
        }
    }

    /// Short, stable name of the variant (used for per-kind counters)
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::Sample(_) => EventKind::Sample,
            DomainEvent::SchedulingSlice(_) => EventKind::SchedulingSlice,
            DomainEvent::FunctionCall(_) => EventKind::FunctionCall,
            DomainEvent::ThreadName(_) => EventKind::ThreadName,
        }
    }
}

/// Discriminant of [`DomainEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Sample,
    SchedulingSlice,
    FunctionCall,
    ThreadName,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Sample => "sample",
            EventKind::SchedulingSlice => "scheduling_slice",
            EventKind::FunctionCall => "function_call",
            EventKind::ThreadName => "thread_name",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_serialization() {
        let sample = CallstackSample {
            timestamp: 1234567890,
            pid: 1000,
            tid: 1001,
            frames: vec![0x400000, 0x400100],
        };

        let json = serde_json::to_string(&sample).unwrap();
        let deserialized: CallstackSample = serde_json::from_str(&json).unwrap();

        assert_eq!(sample, deserialized);
    }

    #[test]
    fn test_function_call_truncated_defaults_false() {
        let json = r#"{"tid":7,"function_id":4096,"begin":10,"end":20,"depth":0}"#;
        let call: FunctionCall = serde_json::from_str(json).unwrap();
        assert!(!call.truncated);
    }

    #[test]
    fn test_accessors() {
        let slice = DomainEvent::SchedulingSlice(SchedulingSlice {
            pid: 1,
            tid: 2,
            core: 3,
            start: 100,
            end: 200,
        });
        assert_eq!(slice.timestamp(), 100);
        assert_eq!(slice.tid(), 2);
        assert_eq!(slice.kind(), EventKind::SchedulingSlice);
        assert_eq!(slice.kind().to_string(), "scheduling_slice");
    }
}
