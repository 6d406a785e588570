//! Capture command implementation

use crate::output::{self, OutputFormat};
use anyhow::{Context, Result};
use aperture_capture::retry::retry_with_backoff_if;
use aperture_capture::{CaptureClient, CaptureError, CaptureOptions, ErrorKind, SessionOutcome};
use aperture_shared::types::target::{CaptureTarget, FunctionInfo};
use aperture_shared::utils::{parse_address, parse_duration};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct CaptureArgs {
    /// Capture service address (host:port); overrides the config file
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Process ID to capture
    #[arg(short, long)]
    pub pid: i32,

    /// Function to instrument, as ADDR=NAME (e.g. 0x401000=main); repeatable
    #[arg(short, long = "function", value_name = "ADDR=NAME", value_parser = parse_function)]
    pub functions: Vec<(u64, String)>,

    /// Capture duration (e.g., "30s", "5m"); runs until Ctrl-C if omitted
    #[arg(short, long)]
    pub duration: Option<String>,

    /// How long to wait for the service to flush after stop (e.g., "2s")
    #[arg(long)]
    pub drain_timeout: Option<String>,

    /// Sampling frequency in Hz
    #[arg(short, long)]
    pub sampling_rate: Option<u64>,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Summary)]
    pub format: OutputFormat,

    /// Additional connection attempts before giving up
    #[arg(long, default_value = "3")]
    pub connect_retries: u32,

    /// Verbose logging; also dumps capture metrics when the session ends
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_function(s: &str) -> Result<(u64, String), String> {
    let (address, name) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ADDR=NAME, got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing function name in '{}'", s));
    }
    let address = parse_address(address).map_err(|e| format!("{:#}", e))?;
    Ok((address, name.to_string()))
}

fn build_options(args: &CaptureArgs) -> Result<CaptureOptions> {
    let mut options = CaptureOptions::load(args.config.as_deref())?;

    if let Some(endpoint) = &args.endpoint {
        options.endpoint = endpoint.clone();
    }
    if let Some(rate) = args.sampling_rate {
        options.sampling_rate_hz = rate;
    }
    if let Some(drain) = &args.drain_timeout {
        let drain = parse_duration(drain).context("Failed to parse drain timeout")?;
        options.drain_timeout_ms = drain.as_millis() as u64;
    }

    options.validate().context("Invalid capture options")?;
    Ok(options)
}

fn build_target(args: &CaptureArgs) -> Result<CaptureTarget> {
    let target = args
        .functions
        .iter()
        .fold(CaptureTarget::new(args.pid), |target, (address, name)| {
            target.with_function(*address, FunctionInfo::new(name.as_str()))
        });
    target.validate().context("Invalid capture target")?;
    Ok(target)
}

async fn deadline(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

pub async fn run(args: CaptureArgs) -> Result<()> {
    let options = build_options(&args)?;
    let target = build_target(&args)?;
    let duration = args
        .duration
        .as_deref()
        .map(parse_duration)
        .transpose()
        .context("Failed to parse duration")?;

    let sink = Arc::new(args.format.sink());
    let client = CaptureClient::tcp(sink.clone(), options);

    let session = retry_with_backoff_if(
        "Connecting to capture service",
        args.connect_retries.saturating_add(1),
        Duration::from_millis(500),
        || client.start_capture(target.clone()),
        |e: &CaptureError| e.kind() == ErrorKind::ConnectionError,
    )
    .await
    .context("Failed to start capture")?;

    info!(
        session,
        pid = target.pid,
        endpoint = %client.options().endpoint,
        "Capture running, press Ctrl-C to stop"
    );

    let stop_reason = tokio::select! {
        _ = sink.finished() => None,
        _ = tokio::signal::ctrl_c() => Some("interrupted"),
        _ = deadline(duration) => Some("duration elapsed"),
    };

    if let Some(reason) = stop_reason {
        info!(reason, "Stopping capture");
        // The session may have ended on its own in the meantime
        if let Err(e) = client.stop_capture() {
            debug!("Stop not needed: {}", e);
        }
    }

    let report = client
        .wait_finished()
        .await
        .context("Capture session did not produce a report")?;
    sink.report(&report);
    if args.verbose {
        eprint!("{}", aperture_capture::metrics::encode_metrics());
    }

    if let SessionOutcome::Failed { kind, .. } = &report.outcome {
        anyhow::bail!("Capture session {} failed: {}", report.session_id, kind);
    }
    if report.truncated() && args.format == OutputFormat::Summary {
        output::warning("Trailing events may be missing from this capture");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: CaptureArgs,
    }

    fn parse(argv: &[&str]) -> CaptureArgs {
        TestCli::try_parse_from(std::iter::once("aperture").chain(argv.iter().copied()))
            .unwrap()
            .args
    }

    #[test]
    fn test_parse_function() {
        assert_eq!(parse_function("0x1000=foo").unwrap(), (0x1000, "foo".to_string()));
        assert_eq!(parse_function("4096= bar ").unwrap(), (4096, "bar".to_string()));
        assert!(parse_function("0x1000").is_err());
        assert!(parse_function("0x1000=").is_err());
        assert!(parse_function("zz=foo").is_err());
    }

    #[test]
    fn test_args_build_target() {
        let args = parse(&["--pid", "42", "-f", "0x1000=foo", "-f", "0x2000=bar"]);
        assert_eq!(args.format, OutputFormat::Summary);
        assert_eq!(args.connect_retries, 3);

        let target = build_target(&args).unwrap();
        assert_eq!(target.pid, 42);
        assert_eq!(target.functions.len(), 2);
        assert_eq!(target.function(0x2000).unwrap().name, "bar");
    }

    #[test]
    fn test_target_without_functions_rejected() {
        let args = parse(&["--pid", "42"]);
        assert!(build_target(&args).is_err());
    }

    #[test]
    fn test_flags_override_options() {
        let args = parse(&[
            "--pid",
            "42",
            "-f",
            "0x1000=foo",
            "--endpoint",
            "10.0.0.1:9000",
            "--drain-timeout",
            "500ms",
            "--sampling-rate",
            "250",
            "--format",
            "json",
        ]);
        let options = build_options(&args).unwrap();
        assert_eq!(options.endpoint, "10.0.0.1:9000");
        assert_eq!(options.drain_timeout_ms, 500);
        assert_eq!(options.sampling_rate_hz, 250);
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = parse(&["--pid", "42", "-f", "0x1000=foo", "--sampling-rate", "0"]);
        assert!(build_options(&args).is_err());
    }
}
