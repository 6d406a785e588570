//! Capture session controller
//!
//! [`CaptureClient`] is the foreground half of the engine. It validates and
//! starts captures, hands stop requests to the session task, and offers a join
//! point for the task. It never waits on capture progress itself.

use crate::config::CaptureOptions;
use crate::error::{CaptureError, ErrorKind, TransportError};
use crate::listener::CaptureListener;
use crate::processor::EventProcessor;
use crate::session::{lock, CaptureState, SessionCell, SessionId, SessionReport, SessionTask};
use crate::transport::tcp::TcpConnector;
use crate::transport::{Connector, Transport};
use aperture_shared::protocol::wire::CaptureRequest;
use aperture_shared::types::target::CaptureTarget;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identify this client to the capture service by hostname (or fallback to PID).
fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("aperture-{}", std::process::id()))
}

/// Resets the session to Idle if a start is abandoned before its task is spawned,
/// including when the `start_capture` future itself is dropped.
struct PendingStart<'a> {
    cell: &'a Mutex<SessionCell>,
    armed: bool,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.cell).abandon_start();
        }
    }
}

/// Controls capture sessions against one capture service.
///
/// At most one session is active at a time. The listener is shared with every
/// session task this client spawns and is only called from those tasks.
///
/// Must be used from within a tokio runtime.
pub struct CaptureClient {
    connector: Arc<dyn Connector>,
    listener: Arc<dyn CaptureListener>,
    options: CaptureOptions,
    client_id: String,
    cell: Arc<Mutex<SessionCell>>,
    worker: Mutex<Option<JoinHandle<SessionReport>>>,
    shutdown: CancellationToken,
}

impl CaptureClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        listener: Arc<dyn CaptureListener>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            connector,
            listener,
            options,
            client_id: default_client_id(),
            cell: Arc::new(Mutex::new(SessionCell::default())),
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Client connecting over TCP to `options.endpoint`
    pub fn tcp(listener: Arc<dyn CaptureListener>, options: CaptureOptions) -> Self {
        let connector = Arc::new(TcpConnector::from_options(&options));
        Self::new(connector, listener, options)
    }

    /// Override the client id sent in start requests
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    pub fn state(&self) -> CaptureState {
        lock(&self.cell).state()
    }

    /// Id of the session in progress, if any
    pub fn current_session(&self) -> Option<SessionId> {
        let cell = lock(&self.cell);
        match cell.state() {
            CaptureState::Idle => None,
            _ => Some(cell.session_id()),
        }
    }

    /// Report of the most recently finished session
    pub fn last_report(&self) -> Option<SessionReport> {
        lock(&self.cell).last_report()
    }

    /// Error recorded by the current or most recent session, if it failed
    pub fn last_error(&self) -> Option<(ErrorKind, String)> {
        lock(&self.cell).error()
    }

    /// Start a capture of `target`.
    ///
    /// Returns once the start request has been handed to the transport; events
    /// are delivered to the listener by a background task. Fails without side
    /// effects on an invalid target or when a session is already running.
    pub async fn start_capture(&self, target: CaptureTarget) -> Result<SessionId, CaptureError> {
        target.validate()?;

        if self.state() != CaptureState::Idle {
            self.reap_panicked_worker().await;
        }

        let (session_id, stop) = {
            let mut cell = lock(&self.cell);
            if cell.state() != CaptureState::Idle {
                return Err(CaptureError::AlreadyCapturing);
            }
            cell.begin()
        };
        let mut pending = PendingStart {
            cell: &self.cell,
            armed: true,
        };

        // The previous task reset the cell to Idle as its last step, so it is done
        // or about to be.
        let previous = lock(&self.worker).take();
        if let Some(handle) = previous {
            if let Err(e) = handle.await {
                warn!("Previous capture session task failed: {}", e);
            }
        }

        info!(
            session = session_id,
            pid = target.pid,
            functions = target.functions.len(),
            endpoint = %self.options.endpoint,
            "Starting capture"
        );

        let mut transport = self.open().await.map_err(CaptureError::Connection)?;
        let request = CaptureRequest::start(&target, &self.client_id, self.options.sampling_rate_hz);
        if let Err(e) = transport.send(&request).await {
            transport.cancel().await;
            return Err(CaptureError::Connection(e));
        }

        let task = SessionTask::new(
            session_id,
            self.cell.clone(),
            transport,
            EventProcessor::new(target.functions.keys().copied()),
            self.listener.clone(),
            stop,
            self.shutdown.clone(),
            self.options.drain_timeout(),
        );
        let handle = tokio::spawn(task.run());
        *lock(&self.worker) = Some(handle);
        pending.armed = false;

        debug!(session = session_id, "Capture session task spawned");
        Ok(session_id)
    }

    /// Request a graceful stop of the running capture.
    ///
    /// Only hands the request to the session task: draining continues in the
    /// background for up to `drain_timeout`. Stopping a session that is already
    /// stopping or finished is a no-op.
    pub fn stop_capture(&self) -> Result<(), CaptureError> {
        let mut cell = lock(&self.cell);
        match cell.state() {
            CaptureState::Idle => Err(CaptureError::NotCapturing),
            CaptureState::Starting | CaptureState::Capturing => {
                cell.request_stop();
                info!(session = cell.session_id(), "Stopping capture");
                Ok(())
            }
            CaptureState::Stopping | CaptureState::Finished | CaptureState::Error => {
                debug!(session = cell.session_id(), "Capture already stopping");
                Ok(())
            }
        }
    }

    /// Wait for the running session task to finish and return its report.
    ///
    /// Returns the last report immediately when no task is running.
    pub async fn wait_finished(&self) -> Option<SessionReport> {
        let handle = lock(&self.worker).take();
        match handle {
            Some(handle) => match handle.await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("Capture session task failed: {}", e);
                    let mut cell = lock(&self.cell);
                    cell.abandon_start();
                    cell.last_report()
                }
            },
            None => self.last_report(),
        }
    }

    /// A session task that panicked in a listener callback never resets the
    /// session. Reap it and return the session to Idle.
    async fn reap_panicked_worker(&self) {
        let handle = {
            let mut worker = lock(&self.worker);
            match worker.as_ref() {
                Some(handle) if handle.is_finished() => worker.take(),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            return;
        };
        if let Err(e) = handle.await {
            warn!("Capture session task failed: {}", e);
            lock(&self.cell).abandon_start();
        }
    }

    async fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        let endpoint = self.options.endpoint.as_str();
        let timeout = self.options.connect_timeout();
        match tokio::time::timeout(timeout, self.connector.open(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            }),
        }
    }
}

impl Drop for CaptureClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
