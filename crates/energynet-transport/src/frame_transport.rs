//! Frame transport: send one frame, pull the next decoded frame from a
//! lazy sequence, close (§9 "coroutine receive flow").
//!
//! The "lazy, restartable-once sequence of `ParseResult<Frame>`" from the
//! design notes is modeled here as a pull method, [`FrameTransport::recv_frame`],
//! rather than a `Stream` impl: the session task (§4.5) already consumes
//! frames one at a time in a simple loop, and a plain async method avoids
//! pinning/`Stream` ceremony for a single consumer with no fan-out.

use std::collections::VecDeque;

use energynet_wire::{Frame, PrefixDecodeOutcome, DEFAULT_MAX_FRAME_BYTES};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{TransportError, TransportResult};

/// Initial read-buffer chunk size per socket read.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Abstracts a byte pipe carrying EnergyNet frames (§4.2, component 5).
#[async_trait::async_trait]
pub trait FrameTransport: Send + Sync {
    /// Encode and send one frame.
    async fn send_frame(&mut self, frame: &Frame) -> TransportResult<()>;

    /// Pull the next frame from the underlying byte stream. Returns
    /// `Ok(None)` on clean EOF. A malformed frame is reported as
    /// `Err(_)`; the caller treats that as a terminal transport failure
    /// (§4.5: the session task closes the session on any decode error).
    async fn recv_frame(&mut self) -> TransportResult<Option<Frame>>;

    /// Close the underlying pipe. Idempotent (§7).
    async fn close(&mut self) -> TransportResult<()>;
}

/// A [`FrameTransport`] over a `tokio::net::TcpStream`.
pub struct TcpFrameTransport {
    stream: Option<TcpStream>,
    read_buf: VecDeque<u8>,
    max_frame_bytes: usize,
}

impl TcpFrameTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            read_buf: VecDeque::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(stream: TcpStream, max_frame_bytes: usize) -> Self {
        Self {
            stream: Some(stream),
            read_buf: VecDeque::new(),
            max_frame_bytes,
        }
    }

    fn stream_mut(&mut self) -> TransportResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait::async_trait]
impl FrameTransport for TcpFrameTransport {
    async fn send_frame(&mut self, frame: &Frame) -> TransportResult<()> {
        let bytes = frame.encode()?;
        let stream = self.stream_mut()?;
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> TransportResult<Option<Frame>> {
        loop {
            let contiguous: Vec<u8> = self.read_buf.iter().copied().collect();
            match Frame::try_decode_prefix(&contiguous, self.max_frame_bytes) {
                PrefixDecodeOutcome::Frame { frame, consumed } => {
                    self.read_buf.drain(..consumed);
                    return Ok(Some(frame));
                }
                PrefixDecodeOutcome::Failed(e) => return Err(TransportError::Wire(e)),
                PrefixDecodeOutcome::NeedMoreData => {}
            }

            let mut chunk = vec![0u8; READ_CHUNK_BYTES];
            let stream = self.stream_mut()?;
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            if n == 0 {
                return if self.read_buf.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::Io(
                        "connection closed mid-frame".to_string(),
                    ))
                };
            }
            self.read_buf.extend(&chunk[..n]);
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}
