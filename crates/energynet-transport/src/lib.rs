//! Byte-pipe and message-level transport adapters for the EnergyNet
//! Protocol (§4.2/§4.3's "out of scope" socket mechanics, given a
//! concrete TCP implementation so the rest of the crate is runnable).
//!
//! Two layers:
//!
//! - [`frame_transport`] — abstracts a byte pipe as: send one
//!   [`energynet_wire::Frame`], receive a lazy async stream of decoded
//!   frames, close. [`TcpFrameTransport`](frame_transport::TcpFrameTransport)
//!   is the concrete implementation over a `tokio::net::TcpStream`.
//! - [`message_transport`] — layers the message registry on top of a
//!   frame transport: serialize a [`energynet_wire::Message`] into a
//!   frame and send it, deserialize received frames back into messages.

pub mod frame_transport;
pub mod message_transport;

pub use frame_transport::{FrameTransport, TcpFrameTransport};
pub use message_transport::MessageTransport;

/// Default EnergyNet protocol port (§6).
pub const DEFAULT_PORT: u16 = 56540;

/// Transport-layer errors (§7): socket failures, frame corruption
/// surfaced from the byte pipe, and misuse after close.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("frame codec error: {0}")]
    Wire(#[from] energynet_wire::WireError),

    #[error("transport already closed")]
    Closed,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
