//! Prometheus metrics for capture sessions

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

// ── Stream metrics ───────────────────────────────────────────────────────────

pub static RAW_MESSAGES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "aperture_capture_raw_messages_total",
        "Raw messages received from capture services"
    )
    .unwrap()
});

pub static DOMAIN_EVENTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "aperture_capture_domain_events_total",
        "Decoded events delivered to listeners"
    )
    .unwrap()
});

pub static DECODE_WARNINGS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "aperture_capture_decode_warnings_total",
        "Malformed messages skipped by the event processor"
    )
    .unwrap()
});

pub static SEQUENCE_GAPS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "aperture_capture_sequence_gaps_total",
        "Responses whose sequence number did not follow the previous one"
    )
    .unwrap()
});

// ── Session metrics ──────────────────────────────────────────────────────────

pub static SESSIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "aperture_capture_sessions_total",
        "Capture sessions by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static DRAIN_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "aperture_capture_drain_duration_seconds",
        "Time from stop request to end of session",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
