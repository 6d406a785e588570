//! Output formatting utilities for CLI commands

use aperture_capture::{CaptureListener, DecodeWarning, ErrorKind, SessionOutcome, SessionReport};
use aperture_shared::types::events::{DomainEvent, EventKind};
use clap::ValueEnum;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// Print success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print warning message
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// How captured events are presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Live event counter, per-kind totals at the end
    Summary,
    /// One JSON object per event on stdout
    Json,
}

impl OutputFormat {
    pub fn sink(self) -> Sink {
        let format = match self {
            OutputFormat::Summary => Format::Summary(SummarySink::new()),
            OutputFormat::Json => Format::Json,
        };
        Sink {
            format,
            finished: Notify::new(),
        }
    }
}

enum Format {
    Summary(SummarySink),
    Json,
}

/// Listener that renders a capture in the selected [`OutputFormat`]
pub struct Sink {
    format: Format,
    finished: Notify,
}

impl Sink {
    /// Resolves once the session has reported its terminal callback
    pub async fn finished(&self) {
        self.finished.notified().await
    }

    /// Print the end-of-session summary
    pub fn report(&self, report: &SessionReport) {
        match &self.format {
            Format::Summary(summary) => summary.report(report),
            // Keep stdout machine-readable
            Format::Json => eprintln!(
                "{} session {}: {} ({} events)",
                "ℹ".blue(),
                report.session_id,
                report.outcome.label(),
                report.domain_events
            ),
        }
    }
}

impl CaptureListener for Sink {
    fn on_started(&self) {
        if let Format::Summary(summary) = &self.format {
            summary.spinner.set_message("capturing");
        }
    }

    fn on_events(&self, events: Vec<DomainEvent>) {
        match &self.format {
            Format::Summary(summary) => summary.count(&events),
            Format::Json => print_json_lines(&events),
        }
    }

    fn on_finished(&self, _truncated: bool) {
        if let Format::Summary(summary) = &self.format {
            summary.spinner.finish_and_clear();
        }
        self.finished.notify_one();
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        if let Format::Summary(summary) = &self.format {
            summary.spinner.finish_and_clear();
        }
        error(&format!("Capture failed ({}): {}", kind, message));
        self.finished.notify_one();
    }

    fn on_warning(&self, warning: &DecodeWarning) {
        if let Format::Summary(summary) = &self.format {
            summary.spinner.println(format!("{} {}", "⚠".yellow(), warning));
        }
    }
}

fn print_json_lines(events: &[DomainEvent]) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for event in events {
        let written = serde_json::to_string(event)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(out, "{}", line));
        if let Err(e) = written {
            warn!("Failed to write event: {}", e);
            return;
        }
    }
}

struct SummarySink {
    counts: Mutex<BTreeMap<EventKind, u64>>,
    spinner: ProgressBar,
}

impl SummarySink {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]") {
            spinner.set_style(style);
        }
        spinner.set_message("waiting for capture service");
        spinner.enable_steady_tick(Duration::from_millis(120));
        Self {
            counts: Mutex::new(BTreeMap::new()),
            spinner,
        }
    }

    fn count(&self, events: &[DomainEvent]) {
        let Ok(mut counts) = self.counts.lock() else {
            return;
        };
        for event in events {
            *counts.entry(event.kind()).or_default() += 1;
        }
        let total: u64 = counts.values().sum();
        self.spinner.set_message(format!("capturing: {} events", total));
    }

    fn snapshot(&self) -> BTreeMap<EventKind, u64> {
        self.counts
            .lock()
            .map(|counts| counts.clone())
            .unwrap_or_default()
    }

    fn report(&self, report: &SessionReport) {
        match &report.outcome {
            SessionOutcome::Completed => success(&format!(
                "Capture {} completed in {:.1?}",
                report.session_id, report.elapsed
            )),
            SessionOutcome::Truncated(cause) => warning(&format!(
                "Capture {} truncated ({:?}) after {:.1?}",
                report.session_id, cause, report.elapsed
            )),
            SessionOutcome::Failed { kind, message } => {
                error(&format!(
                    "Capture {} failed ({}): {}",
                    report.session_id, kind, message
                ));
            }
        }

        for (kind, count) in self.snapshot() {
            println!("  {:<18} {}", kind.to_string().bold(), count);
        }
        info(&format!(
            "{} messages, {} events, {} skipped, {} sequence gaps",
            report.raw_messages, report.domain_events, report.decode_warnings, report.sequence_gaps
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_shared::types::events::{CallstackSample, ThreadName};

    fn sample(timestamp: u64) -> DomainEvent {
        DomainEvent::Sample(CallstackSample {
            timestamp,
            pid: 1,
            tid: 1,
            frames: vec![0x1000],
        })
    }

    #[test]
    fn test_summary_counts_per_kind() {
        let summary = SummarySink::new();
        summary.count(&[sample(1), sample(2)]);
        summary.count(&[DomainEvent::ThreadName(ThreadName {
            timestamp: 3,
            pid: 1,
            tid: 1,
            name: "main".to_string(),
        })]);

        let counts = summary.snapshot();
        assert_eq!(counts.get(&EventKind::Sample), Some(&2));
        assert_eq!(counts.get(&EventKind::ThreadName), Some(&1));
        assert_eq!(counts.get(&EventKind::FunctionCall), None);
        summary.spinner.finish_and_clear();
    }

    #[tokio::test]
    async fn test_sink_signals_finish() {
        let sink = OutputFormat::Json.sink();
        sink.on_started();
        sink.on_finished(true);
        // The permit is stored even though nobody was waiting yet
        tokio::time::timeout(Duration::from_secs(1), sink.finished())
            .await
            .unwrap();
    }
}
