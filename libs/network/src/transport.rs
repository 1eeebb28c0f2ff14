//! Byte-stream transport capability.
//!
//! The endpoint consumes connections through the narrow [`ByteTransport`]
//! interface; the bundled implementation frames any `AsyncRead + AsyncWrite`
//! stream with the Reef envelope. Production uses [`TcpConnector`]; tests
//! inject in-memory duplex streams through the same trait.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use reef_codec::{decode_frame, encode_frame, Frame};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// One frame-oriented connection to a service endpoint.
#[async_trait]
pub trait ByteTransport: Send {
    /// Write one frame and flush it to the peer.
    async fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Read the next frame. `Ok(None)` means the peer closed cleanly.
    async fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Shut the connection down.
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports to (host, port) targets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ByteTransport>>;
}

/// Frames an arbitrary byte stream with the Reef envelope, reusing read and
/// write buffers across calls.
pub struct FramedTransport<S> {
    io: S,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    max_body_len: usize,
}

impl<S> FramedTransport<S> {
    pub fn new(io: S, max_body_len: usize) -> Self {
        Self {
            io,
            read_buffer: BytesMut::with_capacity(IO_BUFFER_SIZE),
            write_buffer: BytesMut::with_capacity(IO_BUFFER_SIZE),
            max_body_len,
        }
    }

    /// Mutable access to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }
}

#[async_trait]
impl<S> ByteTransport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_buffer.clear();
        encode_frame(frame, &mut self.write_buffer);

        // Single write call, then flush for immediate transmission.
        self.io
            .write_all(&self.write_buffer)
            .await
            .map_err(|e| ClientError::io("Failed to write frame", e))?;
        self.io
            .flush()
            .await
            .map_err(|e| ClientError::io("Failed to flush stream", e))?;

        debug!(bytes = self.write_buffer.len(), opcode = frame.opcode, "Wrote frame");
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = decode_frame(&mut self.read_buffer, self.max_body_len)? {
                return Ok(Some(frame));
            }
            let read = self
                .io
                .read_buf(&mut self.read_buffer)
                .await
                .map_err(|e| ClientError::io("Failed to read from stream", e))?;
            if read == 0 {
                if !self.read_buffer.is_empty() {
                    return Err(ClientError::Desync {
                        message: "stream closed mid-frame".to_string(),
                    });
                }
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.io
            .shutdown()
            .await
            .map_err(|e| ClientError::io("Failed to shut down stream", e))
    }
}

/// TCP connector with connect timeout and `TCP_NODELAY`.
pub struct TcpConnector {
    connect_timeout: Duration,
    max_body_len: usize,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, max_body_len: usize) -> Self {
        Self {
            connect_timeout,
            max_body_len,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ByteTransport>> {
        let target = format!("{host}:{port}");
        debug!(%target, "Connecting endpoint");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| ClientError::Timeout {
                elapsed_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| ClientError::io(format!("Failed to connect to {target}"), e))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(%target, "Failed to set TCP_NODELAY: {}", e);
        }

        Ok(Box::new(FramedTransport::new(stream, self.max_body_len)))
    }
}
