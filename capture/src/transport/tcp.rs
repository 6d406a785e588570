//! TCP transport with length-delimited frames
//!
//! Every message (request or response) is one frame: a 4-byte big-endian length
//! followed by the bincode payload. Half-close shuts down the write side of the
//! socket, which the service observes as end of the request stream.

use super::{Connector, Transport};
use crate::config::CaptureOptions;
use crate::error::TransportError;
use crate::processor::RawEvent;
use aperture_shared::protocol::wire::CaptureRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

/// Frame codec shared by both ends of a TCP capture stream
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Connects to a capture service over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    max_frame_bytes: usize,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            connect_timeout,
            max_frame_bytes,
        }
    }

    pub fn from_options(options: &CaptureOptions) -> Self {
        Self::new(options.connect_timeout(), options.max_frame_bytes)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Transport>, TransportError> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(TransportError::Refused(endpoint.to_string()))
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    endpoint: endpoint.to_string(),
                    timeout: self.connect_timeout,
                })
            }
        };
        stream.set_nodelay(true)?;
        debug!(endpoint, "Connected to capture service");

        Ok(Box::new(TcpTransport::new(stream, self.max_frame_bytes)))
    }
}

/// Capture stream over one TCP connection
pub struct TcpTransport {
    reader: Option<FramedRead<OwnedReadHalf, LengthDelimitedCodec>>,
    writer: Option<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_frame_bytes: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Some(FramedRead::new(read_half, frame_codec(max_frame_bytes))),
            writer: Some(FramedWrite::new(write_half, frame_codec(max_frame_bytes))),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, request: &CaptureRequest) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        let payload = request
            .to_bytes()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        writer.send(Bytes::from(payload)).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<RawEvent>, TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        match reader.next().await {
            Some(Ok(frame)) => Ok(Some(RawEvent::from(frame.freeze()))),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn half_close(&mut self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.take() {
            SinkExt::<Bytes>::close(&mut writer).await?;
        }
        Ok(())
    }

    async fn cancel(&mut self) {
        self.writer = None;
        self.reader = None;
    }
}
