//! Configuration types for capture sessions

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:44765";

/// Capture client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Address of the capture service (host:port)
    pub endpoint: String,

    /// Maximum time to wait for a graceful end-of-stream after stop before the
    /// transport is cancelled and the capture is reported as truncated
    pub drain_timeout_ms: u64,

    /// Maximum time to wait for the transport to open
    pub connect_timeout_ms: u64,

    /// Largest response frame accepted from the service
    pub max_frame_bytes: usize,

    /// Sampling rate requested from the service
    pub sampling_rate_hz: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            drain_timeout_ms: 2_000,
            connect_timeout_ms: 5_000,
            max_frame_bytes: 16 * 1024 * 1024,
            sampling_rate_hz: 1_000,
        }
    }
}

impl CaptureOptions {
    /// Load options from defaults, then an optional file (TOML/JSON/YAML by
    /// extension), then `APERTURE_*` environment variables
    /// (e.g. `APERTURE_DRAIN_TIMEOUT_MS=500`).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("APERTURE").try_parsing(true))
            .build()
            .context("Failed to read capture configuration")?;

        let options: CaptureOptions = settings
            .try_deserialize()
            .context("Invalid capture configuration")?;
        options.validate().context("Invalid capture configuration")?;
        Ok(options)
    }

    /// Drain grace period after stop
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.trim().is_empty() {
            anyhow::bail!("Endpoint must not be empty");
        }

        if self.drain_timeout_ms == 0 {
            anyhow::bail!("Drain timeout must be greater than 0");
        }

        if self.connect_timeout_ms == 0 {
            anyhow::bail!("Connect timeout must be greater than 0");
        }

        if self.max_frame_bytes < 1024 {
            anyhow::bail!("Max frame size too small (min 1024 bytes)");
        }

        if self.sampling_rate_hz == 0 {
            anyhow::bail!("Sampling rate must be greater than 0");
        }

        if self.sampling_rate_hz > 10000 {
            anyhow::bail!("Sampling rate too high (max 10000 Hz)");
        }

        Ok(())
    }
}
