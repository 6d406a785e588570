//! Duplex transports between the capture client and a capture service
//!
//! The engine only relies on the capability set below; `tcp` is the network
//! implementation and `channel` an in-process one.

pub mod channel;
pub mod tcp;

use crate::error::TransportError;
use crate::processor::RawEvent;
use aperture_shared::protocol::wire::CaptureRequest;
use async_trait::async_trait;

/// An open, exclusively owned capture stream.
#[async_trait]
pub trait Transport: Send {
    /// Send one request to the service
    async fn send(&mut self, request: &CaptureRequest) -> Result<(), TransportError>;

    /// Wait for the next response. `Ok(None)` is end-of-stream.
    ///
    /// Must be cancel-safe: dropping the returned future before it completes
    /// must not lose a message.
    async fn receive(&mut self) -> Result<Option<RawEvent>, TransportError>;

    /// Close the send direction; responses keep flowing until the service ends
    /// the stream. Calling it again is a no-op.
    async fn half_close(&mut self) -> Result<(), TransportError>;

    /// Abort both directions. Messages still in flight are lost.
    async fn cancel(&mut self);
}

/// Opens transports to a capture service endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Transport>, TransportError>;
}
