//! In-process transport backed by tokio channels
//!
//! [`duplex`] returns the client end (a [`Transport`]) and a [`ServiceEnd`] that
//! plays the capture service: it reads requests, writes responses, injects
//! errors and ends the stream. Used to embed a service in the same process and
//! to script sessions in tests.

use super::{Connector, Transport};
use crate::error::TransportError;
use crate::processor::RawEvent;
use aperture_shared::protocol::wire::{CaptureRequest, CaptureResponse};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type ResponseItem = Result<RawEvent, TransportError>;

#[derive(Debug, Default)]
struct Counters {
    half_closes: AtomicUsize,
    cancels: AtomicUsize,
}

/// Create a connected client/service pair
pub fn duplex() -> (ChannelTransport, ServiceEnd) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());

    let transport = ChannelTransport {
        requests: Some(request_tx),
        responses: response_rx,
        counters: counters.clone(),
    };
    let service = ServiceEnd {
        requests: request_rx,
        responses: Some(response_tx),
        counters,
    };
    (transport, service)
}

/// Client end of an in-process capture stream
#[derive(Debug)]
pub struct ChannelTransport {
    requests: Option<mpsc::UnboundedSender<CaptureRequest>>,
    responses: mpsc::UnboundedReceiver<ResponseItem>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, request: &CaptureRequest) -> Result<(), TransportError> {
        let requests = self.requests.as_ref().ok_or(TransportError::Closed)?;
        requests
            .send(request.clone())
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<Option<RawEvent>, TransportError> {
        match self.responses.recv().await {
            Some(Ok(raw)) => Ok(Some(raw)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn half_close(&mut self) -> Result<(), TransportError> {
        self.counters.half_closes.fetch_add(1, Ordering::SeqCst);
        self.requests = None;
        Ok(())
    }

    async fn cancel(&mut self) {
        self.counters.cancels.fetch_add(1, Ordering::SeqCst);
        self.requests = None;
        self.responses.close();
    }
}

/// Service end of an in-process capture stream
#[derive(Debug)]
pub struct ServiceEnd {
    requests: mpsc::UnboundedReceiver<CaptureRequest>,
    responses: Option<mpsc::UnboundedSender<ResponseItem>>,
    counters: Arc<Counters>,
}

impl ServiceEnd {
    /// Next request from the client; `None` once the client half-closed or cancelled
    pub async fn next_request(&mut self) -> Option<CaptureRequest> {
        self.requests.recv().await
    }

    /// Request already sent by the client, without waiting
    pub fn try_next_request(&mut self) -> Option<CaptureRequest> {
        self.requests.try_recv().ok()
    }

    /// Encode and send a response. Returns false if the stream is gone.
    pub fn respond(&self, response: &CaptureResponse) -> bool {
        match response.to_bytes() {
            Ok(payload) => self.respond_raw(payload),
            Err(_) => false,
        }
    }

    /// Send an arbitrary payload as one response message
    pub fn respond_raw(&self, payload: impl Into<Bytes>) -> bool {
        self.push(Ok(RawEvent::new(payload)))
    }

    /// Make the client's next receive fail with `error`
    pub fn fail(&self, error: TransportError) -> bool {
        self.push(Err(error))
    }

    /// End the response stream; the client sees end-of-stream after draining
    /// what was already sent
    pub fn close(&mut self) {
        self.responses = None;
    }

    /// Number of times the client half-closed its send direction
    pub fn half_close_count(&self) -> usize {
        self.counters.half_closes.load(Ordering::SeqCst)
    }

    /// Number of times the client cancelled the stream
    pub fn cancel_count(&self) -> usize {
        self.counters.cancels.load(Ordering::SeqCst)
    }

    fn push(&self, item: ResponseItem) -> bool {
        match &self.responses {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

/// Connector handing out prepared in-process transports, one per `open`.
///
/// `open` fails with [`TransportError::Refused`] when nothing is prepared.
#[derive(Debug, Default)]
pub struct ChannelConnector {
    pending: Mutex<VecDeque<ChannelTransport>>,
    opens: AtomicUsize,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare a transport for the next `open` and return its service end
    pub fn prepare(&self) -> ServiceEnd {
        let (transport, service) = duplex();
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(transport);
        }
        service
    }

    /// Number of `open` calls observed, successful or not
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let transport = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.pop_front());
        match transport {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(TransportError::Refused(endpoint.to_string())),
        }
    }
}
