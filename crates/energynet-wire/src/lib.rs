//! Binary wire codec for the EnergyNet Protocol.
//!
//! Three layers, matching §4 of the protocol design:
//!
//! - [`value`] — tagged scalar/composite values, each a single-entry CBOR
//!   map keyed by a stable numeric type ID.
//! - [`frame`] — the magic-prefixed frame envelope wrapping headers,
//!   message type, and payload bytes.
//! - [`message`] — the closed set of typed protocol messages and the
//!   lenient/strict parsing registry.
//!
//! Decoders never panic or propagate exceptions on malformed input
//! (§7): recoverable problems are recorded through
//! [`energynet_diagnostics`] against the calling [`DiagnosticScope`](energynet_diagnostics::DiagnosticScope),
//! and only genuinely fatal shapes (missing a required field, wrong
//! CBOR major type where a specific one is mandatory) produce a
//! [`WireError`].

pub mod frame;
pub mod message;
pub mod value;

pub use frame::{Frame, Header, PrefixDecodeOutcome, DEFAULT_MAX_FRAME_BYTES};
pub use message::{
    parse, DemandParameters, Message, ParseMode, ParseOutcome, SessionParameters,
    SoftDisconnect, StorageParameters, SupplyParameters,
};
pub use value::{
    Bounds, EnergyMix, EnergySource, IsolationState, IsolationStatus, PriceForecast,
    PriceForecastEntry, SourceMix, Value,
};

/// Fatal (non-recoverable) wire-codec errors.
///
/// These are distinct from [`energynet_diagnostics::Diagnostic`]s:
/// a diagnostic describes a recoverable condition recorded alongside a
/// successful decode, while a `WireError` means the decode could not
/// produce a value at all.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unexpected CBOR shape: {0}")]
    UnexpectedShape(&'static str),

    #[error("unknown value type id: 0x{0:02x}")]
    UnknownTypeId(u64),

    #[error("invalid ISO-8601 timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("value is not a single-entry CBOR map")]
    NotSingleEntryMap,

    #[error("frame read error: {0}")]
    ReadError(String),

    #[error("invalid magic byte")]
    InvalidMagic,

    #[error("invalid frame structure: {0}")]
    InvalidFrame(String),
}

pub type WireResult<T> = std::result::Result<T, WireError>;
