//! Event processor
//!
//! Decodes raw capture responses into domain events. The processor is pure and
//! session-scoped: it never blocks or performs I/O and knows nothing about the
//! transport or the task that drives it. A fresh processor is created for every
//! capture session.

use crate::error::{DecodeWarning, ProcessError, ProtocolViolation};
use aperture_shared::protocol::wire::{CaptureEvent, CaptureResponse, WireError};
use aperture_shared::types::events::{
    CallstackSample, DomainEvent, FunctionCall, FunctionId, SchedulingSlice, StackTrace,
    ThreadName, Tid, Timestamp,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Undecoded message received from the capture service.
///
/// Consumed exactly once by [`EventProcessor::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    payload: Bytes,
}

impl RawEvent {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Vec<u8>> for RawEvent {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<Bytes> for RawEvent {
    fn from(payload: Bytes) -> Self {
        Self { payload }
    }
}

/// Result of decoding one raw message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Processed {
    /// Decoded events in message order
    pub events: Vec<DomainEvent>,
    /// Single events that were dropped; the rest of the message was kept
    pub skipped: Vec<DecodeWarning>,
}

/// Outcome of decoding one wire event
enum Decoded {
    Event(DomainEvent),
    Nothing,
    Skipped(String),
}

/// A function entry still waiting for its exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenCall {
    function_id: FunctionId,
    begin: Timestamp,
}

/// State changes produced by one message, applied only if the whole message decodes.
#[derive(Debug, Default)]
struct Staged {
    strings: HashMap<u64, String>,
    callstacks: HashMap<u64, StackTrace>,
    /// Copy-on-write view of the open-call stacks of threads touched by the message
    threads: HashMap<Tid, Vec<OpenCall>>,
    last_timestamp: Timestamp,
}

/// Session-scoped decoder from [`RawEvent`] to [`DomainEvent`]
#[derive(Debug)]
pub struct EventProcessor {
    functions: HashSet<FunctionId>,
    strings: HashMap<u64, String>,
    callstacks: HashMap<u64, StackTrace>,
    open_calls: BTreeMap<Tid, Vec<OpenCall>>,
    messages: u64,
    expected_sequence: Option<u64>,
    sequence_gaps: u64,
    last_timestamp: Timestamp,
}

impl EventProcessor {
    /// Create a processor for a session instrumenting `functions`
    pub fn new(functions: impl IntoIterator<Item = FunctionId>) -> Self {
        Self {
            functions: functions.into_iter().collect(),
            strings: HashMap::new(),
            callstacks: HashMap::new(),
            open_calls: BTreeMap::new(),
            messages: 0,
            expected_sequence: None,
            sequence_gaps: 0,
            last_timestamp: 0,
        }
    }

    /// Number of raw messages handed to [`process`](Self::process)
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// Number of times the service sequence number did not follow the previous one
    pub fn sequence_gaps(&self) -> u64 {
        self.sequence_gaps
    }

    /// Function calls whose exit has not been observed yet
    pub fn open_call_count(&self) -> usize {
        self.open_calls.values().map(Vec::len).sum()
    }

    /// Decode one raw message.
    ///
    /// Events keep the order in which they appear in the message. A function call
    /// is emitted at the position of its exit.
    ///
    /// Entries and exits that cannot be paired (or name a function outside the
    /// instrumentation set) are dropped one by one and reported in
    /// [`Processed::skipped`]. On `Err(ProcessError::Malformed)` the whole message
    /// is dropped and the processor state is left untouched.
    pub fn process(&mut self, raw: RawEvent) -> Result<Processed, ProcessError> {
        self.messages += 1;
        let message = self.messages;

        let response = match CaptureResponse::from_bytes(raw.as_bytes()) {
            Ok(response) => response,
            Err(e @ WireError::UnsupportedVersion { .. }) => {
                return Err(ProtocolViolation {
                    message,
                    reason: e.to_string(),
                }
                .into())
            }
            Err(e) => {
                // Assume the undecodable message carried the next sequence number.
                self.expected_sequence = self.expected_sequence.map(|s| s.wrapping_add(1));
                return Err(DecodeWarning {
                    message,
                    reason: e.to_string(),
                }
                .into());
            }
        };

        self.track_sequence(response.sequence);

        let mut staged = Staged {
            last_timestamp: self.last_timestamp,
            ..Default::default()
        };
        let mut processed = Processed {
            events: Vec::with_capacity(response.events.len()),
            skipped: Vec::new(),
        };
        for (index, event) in response.events.into_iter().enumerate() {
            match self.decode(event, &mut staged, message)? {
                Decoded::Event(event) => processed.events.push(event),
                Decoded::Nothing => {}
                Decoded::Skipped(reason) => processed.skipped.push(DecodeWarning {
                    message,
                    reason: format!("event {}: {}", index, reason),
                }),
            }
        }

        self.commit(staged);
        Ok(processed)
    }

    /// Flush deferred events and release the processor.
    ///
    /// Calls still open are emitted innermost first, per thread in tid order, as
    /// truncated calls ending at the last timestamp observed in the session.
    pub fn finalize(self) -> Vec<DomainEvent> {
        let mut events = Vec::with_capacity(self.open_call_count());
        for (tid, stack) in &self.open_calls {
            for (depth, call) in stack.iter().enumerate().rev() {
                events.push(DomainEvent::FunctionCall(FunctionCall {
                    tid: *tid,
                    function_id: call.function_id,
                    begin: call.begin,
                    end: self.last_timestamp.max(call.begin),
                    depth: depth as u32,
                    truncated: true,
                }));
            }
        }
        events
    }

    fn track_sequence(&mut self, sequence: u64) {
        if let Some(expected) = self.expected_sequence {
            if sequence != expected {
                self.sequence_gaps += 1;
                warn!(
                    expected,
                    received = sequence,
                    "capture stream sequence gap"
                );
            }
        }
        self.expected_sequence = Some(sequence.wrapping_add(1));
    }

    fn decode(
        &self,
        event: CaptureEvent,
        staged: &mut Staged,
        message: u64,
    ) -> Result<Decoded, ProcessError> {
        let malformed = |reason: String| ProcessError::from(DecodeWarning { message, reason });
        let violation = |reason: String| ProcessError::from(ProtocolViolation { message, reason });

        match event {
            CaptureEvent::InternedString { key, value } => {
                match self.string(staged, key) {
                    Some(existing) if *existing != value => {
                        return Err(violation(format!(
                            "string key {} re-interned with a different value",
                            key
                        )))
                    }
                    Some(_) => {}
                    None => {
                        staged.strings.insert(key, value);
                    }
                }
                Ok(Decoded::Nothing)
            }

            CaptureEvent::InternedCallstack { key, frames } => {
                if frames.is_empty() {
                    return Err(malformed(format!("empty callstack for key {}", key)));
                }
                match self.callstack(staged, key) {
                    Some(existing) if *existing != frames => {
                        return Err(violation(format!(
                            "callstack key {} re-interned with different frames",
                            key
                        )))
                    }
                    Some(_) => {}
                    None => {
                        staged.callstacks.insert(key, frames);
                    }
                }
                Ok(Decoded::Nothing)
            }

            CaptureEvent::CallstackSample {
                timestamp_ns,
                pid,
                tid,
                callstack_key,
            } => {
                let frames = self
                    .callstack(staged, callstack_key)
                    .cloned()
                    .ok_or_else(|| violation(format!("unknown callstack key {}", callstack_key)))?;
                staged.last_timestamp = staged.last_timestamp.max(timestamp_ns);
                Ok(Decoded::Event(DomainEvent::Sample(CallstackSample {
                    timestamp: timestamp_ns,
                    pid,
                    tid,
                    frames,
                })))
            }

            CaptureEvent::SchedulingSlice {
                pid,
                tid,
                core,
                in_timestamp_ns,
                out_timestamp_ns,
            } => {
                if out_timestamp_ns < in_timestamp_ns {
                    return Err(malformed(format!(
                        "scheduling slice of tid {} ends ({}) before it starts ({})",
                        tid, out_timestamp_ns, in_timestamp_ns
                    )));
                }
                staged.last_timestamp = staged.last_timestamp.max(out_timestamp_ns);
                Ok(Decoded::Event(DomainEvent::SchedulingSlice(SchedulingSlice {
                    pid,
                    tid,
                    core,
                    start: in_timestamp_ns,
                    end: out_timestamp_ns,
                })))
            }

            CaptureEvent::FunctionEntry {
                tid,
                function_id,
                timestamp_ns,
            } => {
                if !self.functions.contains(&function_id) {
                    return Ok(Decoded::Skipped(format!(
                        "entry into non-instrumented function {:#x}",
                        function_id
                    )));
                }
                staged.last_timestamp = staged.last_timestamp.max(timestamp_ns);
                self.thread_stack(staged, tid).push(OpenCall {
                    function_id,
                    begin: timestamp_ns,
                });
                Ok(Decoded::Nothing)
            }

            CaptureEvent::FunctionExit {
                tid,
                function_id,
                timestamp_ns,
            } => {
                if !self.functions.contains(&function_id) {
                    return Ok(Decoded::Skipped(format!(
                        "exit from non-instrumented function {:#x}",
                        function_id
                    )));
                }
                let stack = self.thread_stack(staged, tid);
                let open = match stack.last() {
                    Some(open) => *open,
                    None => {
                        return Ok(Decoded::Skipped(format!(
                            "exit from {:#x} on tid {} without a matching entry",
                            function_id, tid
                        )))
                    }
                };
                if open.function_id != function_id {
                    return Ok(Decoded::Skipped(format!(
                        "exit from {:#x} on tid {} while {:#x} is the innermost open call",
                        function_id, tid, open.function_id
                    )));
                }
                if timestamp_ns < open.begin {
                    return Ok(Decoded::Skipped(format!(
                        "exit from {:#x} on tid {} precedes its entry",
                        function_id, tid
                    )));
                }
                stack.pop();
                let depth = stack.len() as u32;
                staged.last_timestamp = staged.last_timestamp.max(timestamp_ns);
                Ok(Decoded::Event(DomainEvent::FunctionCall(FunctionCall {
                    tid,
                    function_id,
                    begin: open.begin,
                    end: timestamp_ns,
                    depth,
                    truncated: false,
                })))
            }

            CaptureEvent::ThreadName {
                pid,
                tid,
                name_key,
                timestamp_ns,
            } => {
                let name = self
                    .string(staged, name_key)
                    .cloned()
                    .ok_or_else(|| violation(format!("unknown string key {}", name_key)))?;
                staged.last_timestamp = staged.last_timestamp.max(timestamp_ns);
                Ok(Decoded::Event(DomainEvent::ThreadName(ThreadName {
                    timestamp: timestamp_ns,
                    pid,
                    tid,
                    name,
                })))
            }
        }
    }

    fn string<'a>(&'a self, staged: &'a Staged, key: u64) -> Option<&'a String> {
        staged.strings.get(&key).or_else(|| self.strings.get(&key))
    }

    fn callstack<'a>(&'a self, staged: &'a Staged, key: u64) -> Option<&'a StackTrace> {
        staged
            .callstacks
            .get(&key)
            .or_else(|| self.callstacks.get(&key))
    }

    fn thread_stack<'a>(&self, staged: &'a mut Staged, tid: Tid) -> &'a mut Vec<OpenCall> {
        staged
            .threads
            .entry(tid)
            .or_insert_with(|| self.open_calls.get(&tid).cloned().unwrap_or_default())
    }

    fn commit(&mut self, staged: Staged) {
        self.strings.extend(staged.strings);
        self.callstacks.extend(staged.callstacks);
        for (tid, stack) in staged.threads {
            if stack.is_empty() {
                self.open_calls.remove(&tid);
            } else {
                self.open_calls.insert(tid, stack);
            }
        }
        self.last_timestamp = staged.last_timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOO: FunctionId = 0x1000;
    const BAR: FunctionId = 0x2000;

    fn raw(sequence: u64, events: Vec<CaptureEvent>) -> RawEvent {
        RawEvent::new(CaptureResponse::new(sequence, events).to_bytes().unwrap())
    }

    fn entry(tid: Tid, function_id: FunctionId, timestamp_ns: Timestamp) -> CaptureEvent {
        CaptureEvent::FunctionEntry {
            tid,
            function_id,
            timestamp_ns,
        }
    }

    fn exit(tid: Tid, function_id: FunctionId, timestamp_ns: Timestamp) -> CaptureEvent {
        CaptureEvent::FunctionExit {
            tid,
            function_id,
            timestamp_ns,
        }
    }

    fn sample(timestamp_ns: Timestamp, callstack_key: u64) -> CaptureEvent {
        CaptureEvent::CallstackSample {
            timestamp_ns,
            pid: 42,
            tid: 7,
            callstack_key,
        }
    }

    fn callstack(key: u64, frames: Vec<u64>) -> CaptureEvent {
        CaptureEvent::InternedCallstack { key, frames }
    }

    #[test]
    fn test_samples_resolve_interned_callstacks_across_messages() {
        let mut processor = EventProcessor::new([FOO]);

        let first = processor
            .process(raw(1, vec![callstack(1, vec![0x10, 0x20]), sample(100, 1)]))
            .unwrap()
            .events;
        let second = processor.process(raw(2, vec![sample(200, 1)])).unwrap().events;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        match &second[0] {
            DomainEvent::Sample(s) => {
                assert_eq!(s.timestamp, 200);
                assert_eq!(s.frames, vec![0x10, 0x20]);
            }
            other => panic!("expected sample, got {:?}", other),
        }
        assert_eq!(processor.messages(), 2);
        assert_eq!(processor.sequence_gaps(), 0);
    }

    #[test]
    fn test_unknown_callstack_key_is_violation() {
        let mut processor = EventProcessor::new([FOO]);
        let err = processor.process(raw(1, vec![sample(100, 9)])).unwrap_err();
        match err {
            ProcessError::Violation(v) => {
                assert_eq!(v.message, 1);
                assert!(v.reason.contains("unknown callstack key 9"));
            }
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_intern_is_violation() {
        let mut processor = EventProcessor::new([FOO]);
        processor
            .process(raw(
                1,
                vec![CaptureEvent::InternedString {
                    key: 1,
                    value: "main".into(),
                }],
            ))
            .unwrap();

        let same = processor.process(raw(
            2,
            vec![CaptureEvent::InternedString {
                key: 1,
                value: "main".into(),
            }],
        ));
        assert_eq!(same, Ok(Processed::default()));

        let conflicting = processor.process(raw(
            3,
            vec![CaptureEvent::InternedString {
                key: 1,
                value: "worker".into(),
            }],
        ));
        assert!(matches!(conflicting, Err(ProcessError::Violation(_))));
    }

    #[test]
    fn test_unsupported_version_is_violation() {
        let mut response = CaptureResponse::new(1, vec![]);
        response.version += 1;
        let mut processor = EventProcessor::new([FOO]);
        let result = processor.process(RawEvent::new(response.to_bytes().unwrap()));
        assert!(matches!(result, Err(ProcessError::Violation(_))));
    }

    #[test]
    fn test_empty_payload_is_skipped() {
        let empty = RawEvent::new(Vec::new());
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 0);

        let mut processor = EventProcessor::new([FOO]);
        let result = processor.process(empty);
        assert!(matches!(result, Err(ProcessError::Malformed(_))));

        let valid = raw(2, vec![sample(10, 1)]);
        assert!(!valid.is_empty());
        assert_eq!(valid.len(), valid.as_bytes().len());
    }

    #[test]
    fn test_garbage_is_skipped_without_poisoning_stream() {
        let mut processor = EventProcessor::new([FOO]);
        processor
            .process(raw(1, vec![callstack(1, vec![0x10])]))
            .unwrap();

        let garbage = processor.process(RawEvent::new(vec![0x01, 0x00]));
        assert!(matches!(garbage, Err(ProcessError::Malformed(_))));

        // Message 2 was lost to garbage; 3 follows without a reported gap.
        let processed = processor.process(raw(3, vec![sample(300, 1)])).unwrap();
        assert_eq!(processed.events.len(), 1);
        assert_eq!(processor.sequence_gaps(), 0);
        assert_eq!(processor.messages(), 3);
    }

    #[test]
    fn test_malformed_message_leaves_state_untouched() {
        let mut processor = EventProcessor::new([FOO]);

        // Interns key 1 and opens a call, then hits a bad slice: nothing is kept.
        let result = processor.process(raw(
            1,
            vec![
                callstack(1, vec![0x10]),
                entry(7, FOO, 10),
                CaptureEvent::SchedulingSlice {
                    pid: 42,
                    tid: 7,
                    core: 0,
                    in_timestamp_ns: 50,
                    out_timestamp_ns: 40,
                },
            ],
        ));
        match result {
            Err(ProcessError::Malformed(w)) => assert_eq!(w.message, 1),
            other => panic!("expected malformed, got {:?}", other),
        }
        assert_eq!(processor.open_call_count(), 0);

        // Key 1 was never committed.
        let err = processor.process(raw(2, vec![sample(60, 1)])).unwrap_err();
        assert!(matches!(err, ProcessError::Violation(_)));
    }

    #[test]
    fn test_function_calls_pair_entries_and_exits() {
        let mut processor = EventProcessor::new([FOO, BAR]);

        let opened = processor
            .process(raw(1, vec![entry(7, FOO, 10), entry(7, BAR, 20)]))
            .unwrap();
        assert!(opened.events.is_empty());
        assert_eq!(processor.open_call_count(), 2);

        let closed = processor
            .process(raw(2, vec![exit(7, BAR, 30), exit(7, FOO, 40)]))
            .unwrap()
            .events;
        assert_eq!(
            closed,
            vec![
                DomainEvent::FunctionCall(FunctionCall {
                    tid: 7,
                    function_id: BAR,
                    begin: 20,
                    end: 30,
                    depth: 1,
                    truncated: false,
                }),
                DomainEvent::FunctionCall(FunctionCall {
                    tid: 7,
                    function_id: FOO,
                    begin: 10,
                    end: 40,
                    depth: 0,
                    truncated: false,
                }),
            ]
        );
        assert_eq!(processor.open_call_count(), 0);
        assert!(processor.finalize().is_empty());
    }

    #[test]
    fn test_mismatched_exit_is_skipped() {
        let mut processor = EventProcessor::new([FOO, BAR]);
        processor.process(raw(1, vec![entry(7, FOO, 10)])).unwrap();

        let processed = processor
            .process(raw(2, vec![exit(7, BAR, 20), exit(7, FOO, 5)]))
            .unwrap();
        assert!(processed.events.is_empty());
        assert_eq!(processed.skipped.len(), 2);
        assert!(processed.skipped[0].reason.contains("innermost open call"));
        assert!(processed.skipped[1].reason.contains("precedes its entry"));

        // The open FOO call survived both bad exits.
        assert_eq!(processor.open_call_count(), 1);
        let events = processor.process(raw(3, vec![exit(7, FOO, 30)])).unwrap().events;
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_non_instrumented_function_is_skipped() {
        let mut processor = EventProcessor::new([FOO]);
        let processed = processor
            .process(raw(1, vec![entry(7, BAR, 10), entry(7, FOO, 11), exit(7, BAR, 12)]))
            .unwrap();
        assert_eq!(processed.skipped.len(), 2);
        assert_eq!(processed.skipped[0].message, 1);
        assert!(processed.skipped[0].reason.starts_with("event 0:"));
        assert!(processed.skipped[1].reason.starts_with("event 2:"));
        assert_eq!(processor.open_call_count(), 1);
    }

    #[test]
    fn test_unpaired_exit_does_not_poison_later_messages() {
        let mut processor = EventProcessor::new([FOO]);

        // A bad slice drops the whole message, including the entry it carried.
        let first = processor.process(raw(
            1,
            vec![
                entry(7, FOO, 10),
                CaptureEvent::SchedulingSlice {
                    pid: 42,
                    tid: 7,
                    core: 0,
                    in_timestamp_ns: 50,
                    out_timestamp_ns: 40,
                },
            ],
        ));
        assert!(matches!(first, Err(ProcessError::Malformed(_))));

        // The exit has nothing to pair with: only that event is dropped.
        let second = processor
            .process(raw(
                2,
                vec![callstack(1, vec![0x10]), sample(60, 1), exit(7, FOO, 70)],
            ))
            .unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.skipped.len(), 1);
        assert!(second.skipped[0].reason.contains("without a matching entry"));

        // Callstack 1 from the second message was committed.
        let third = processor.process(raw(3, vec![sample(80, 1)])).unwrap();
        assert_eq!(third.events.len(), 1);
        assert!(third.skipped.is_empty());
    }

    #[test]
    fn test_finalize_flushes_open_calls_as_truncated() {
        let mut processor = EventProcessor::new([FOO, BAR]);
        processor
            .process(raw(
                1,
                vec![entry(3, FOO, 10), entry(3, BAR, 15), entry(1, FOO, 12)],
            ))
            .unwrap();
        processor
            .process(raw(
                2,
                vec![CaptureEvent::SchedulingSlice {
                    pid: 42,
                    tid: 1,
                    core: 2,
                    in_timestamp_ns: 20,
                    out_timestamp_ns: 90,
                }],
            ))
            .unwrap();

        let flushed = processor.finalize();
        let calls: Vec<(Tid, FunctionId, u32, Timestamp, bool)> = flushed
            .iter()
            .map(|e| match e {
                DomainEvent::FunctionCall(c) => (c.tid, c.function_id, c.depth, c.end, c.truncated),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            calls,
            vec![
                (1, FOO, 0, 90, true),
                (3, BAR, 1, 90, true),
                (3, FOO, 0, 90, true),
            ]
        );
    }

    #[test]
    fn test_sequence_gap_is_counted_not_reordered() {
        let mut processor = EventProcessor::new([FOO]);
        processor
            .process(raw(1, vec![callstack(1, vec![0x10])]))
            .unwrap();
        let events = processor.process(raw(5, vec![sample(10, 1)])).unwrap().events;
        assert_eq!(events.len(), 1);
        processor.process(raw(6, vec![])).unwrap();
        assert_eq!(processor.sequence_gaps(), 1);
    }

    #[test]
    fn test_thread_names_resolve_strings() {
        let mut processor = EventProcessor::new([FOO]);
        let events = processor
            .process(raw(
                1,
                vec![
                    CaptureEvent::InternedString {
                        key: 4,
                        value: "render".into(),
                    },
                    CaptureEvent::ThreadName {
                        pid: 42,
                        tid: 9,
                        name_key: 4,
                        timestamp_ns: 5,
                    },
                ],
            ))
            .unwrap()
            .events;
        assert_eq!(
            events,
            vec![DomainEvent::ThreadName(ThreadName {
                timestamp: 5,
                pid: 42,
                tid: 9,
                name: "render".into(),
            })]
        );
    }
}
