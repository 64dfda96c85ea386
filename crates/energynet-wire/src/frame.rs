//! Frame codec (§4.2): the magic-prefixed envelope wrapping headers, a
//! message type ID, and an opaque payload.
//!
//! ```text
//! 9A 00 00 00 03   CBOR array(3), deliberately non-canonical 4-byte length (magic)
//! <headers>        CBOR null when empty, else CBOR map<u32 -> header-value>
//! 1A XX XX XX XX   CBOR uint32 (always 4-byte form) = message_type_id
//! <payload>        CBOR bytestring
//! ```
//!
//! `0x9A` is itself a structurally valid (if non-canonical) CBOR
//! array-of-N header — major type 4, additional info 26 meaning "length
//! follows as 4 bytes" — so once the magic form has been identified for
//! diagnostic purposes, the remainder of the frame can be decoded as one
//! ordinary CBOR array value and split into its three elements.

use std::collections::BTreeMap;

use ciborium::value::{Integer, Value as Cbor};

use energynet_diagnostics as diag;

use crate::value::as_i64;
use crate::{WireError, WireResult};

/// Default per-frame size cap (§4.2): guards against a corrupted length
/// field triggering an unbounded allocation.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

const CANONICAL_ARRAY3: u8 = 0x83;
const NONCANONICAL_ARRAY_PREFIX: u8 = 0x9A;
const UINT32_PREFIX: u8 = 0x1A;

/// A header value attached to a [`Frame`] (§3).
#[derive(Clone, Debug, PartialEq)]
pub enum Header {
    Text(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Float(f64),
    Null,
}

fn header_to_cbor(h: &Header) -> Cbor {
    match h {
        Header::Text(s) => Cbor::Text(s.clone()),
        Header::Int(i) => Cbor::Integer(Integer::from(*i)),
        Header::Bool(b) => Cbor::Bool(*b),
        Header::Bytes(b) => Cbor::Bytes(b.clone()),
        Header::Float(f) => Cbor::Float(*f),
        Header::Null => Cbor::Null,
    }
}

/// The wire envelope (§3): `{ headers, message_type_id, payload }`.
///
/// Headers compare by (key, value) set equality — see the `PartialEq`
/// derived on the underlying `BTreeMap` — with byte-content equality for
/// bytestring header values, matching §8's round-trip invariant.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub headers: BTreeMap<u32, Header>,
    pub message_type_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type_id: u32, payload: Vec<u8>) -> Self {
        Self {
            headers: BTreeMap::new(),
            message_type_id,
            payload,
        }
    }

    /// Encode this frame to its deterministic wire form. The same frame
    /// always produces the same bytes (§4.2, §8).
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(9 + self.payload.len() + 16);
        buf.extend_from_slice(&[NONCANONICAL_ARRAY_PREFIX, 0x00, 0x00, 0x00, 0x03]);

        let headers_cbor = if self.headers.is_empty() {
            Cbor::Null
        } else {
            Cbor::Map(
                self.headers
                    .iter()
                    .map(|(k, v)| (Cbor::Integer(Integer::from(*k)), header_to_cbor(v)))
                    .collect(),
            )
        };
        ciborium::into_writer(&headers_cbor, &mut buf)
            .map_err(|e| WireError::InvalidFrame(format!("failed to encode headers: {e}")))?;

        buf.push(UINT32_PREFIX);
        buf.extend_from_slice(&self.message_type_id.to_be_bytes());

        let payload_cbor = Cbor::Bytes(self.payload.clone());
        ciborium::into_writer(&payload_cbor, &mut buf)
            .map_err(|e| WireError::InvalidFrame(format!("failed to encode payload: {e}")))?;

        Ok(buf)
    }

    /// Decode one frame from the start of `bytes`, treating `bytes` as
    /// the complete remaining input (not a partial prefix awaiting more
    /// data — see [`Frame::try_decode_prefix`] for the streaming case).
    ///
    /// Returns `None` on clean EOF (`bytes` is empty). Never panics;
    /// malformed input always yields `Some(Err(_))` with diagnostics
    /// recorded against the caller's [`energynet_diagnostics::DiagnosticScope`].
    pub fn decode(bytes: &[u8], max_bytes: usize) -> Option<WireResult<(Frame, usize)>> {
        if bytes.is_empty() {
            return None;
        }
        Some(match decode_inner(bytes, max_bytes) {
            InnerOutcome::Ok { frame, consumed } => Ok((frame, consumed)),
            InnerOutcome::Underrun => {
                diag::error("READ_ERROR", "frame truncated: not enough bytes to decode a complete frame");
                Err(WireError::ReadError("truncated frame".to_string()))
            }
            InnerOutcome::CapExceeded => {
                diag::error("READ_ERROR", format!("frame exceeds the {max_bytes}-byte size cap"));
                Err(WireError::ReadError("size cap exceeded".to_string()))
            }
            InnerOutcome::Invalid(code, msg) => {
                diag::error(code, msg.clone());
                Err(match code {
                    "INVALID_MAGIC" => WireError::InvalidMagic,
                    _ => WireError::InvalidFrame(msg),
                })
            }
        })
    }

    /// Streaming variant used by [`energynet_transport`]: like
    /// [`Frame::decode`], but distinguishes "not enough bytes buffered
    /// yet, read more from the socket" from a genuinely malformed frame.
    /// Used so an incrementally-filled read buffer doesn't get treated
    /// as corrupted input while a frame is still arriving.
    pub fn try_decode_prefix(bytes: &[u8], max_bytes: usize) -> PrefixDecodeOutcome {
        if bytes.is_empty() {
            return PrefixDecodeOutcome::NeedMoreData;
        }
        match decode_inner(bytes, max_bytes) {
            InnerOutcome::Ok { frame, consumed } => PrefixDecodeOutcome::Frame { frame, consumed },
            InnerOutcome::Underrun => PrefixDecodeOutcome::NeedMoreData,
            InnerOutcome::CapExceeded => {
                diag::error("READ_ERROR", format!("frame exceeds the {max_bytes}-byte size cap"));
                PrefixDecodeOutcome::Failed(WireError::ReadError("size cap exceeded".to_string()))
            }
            InnerOutcome::Invalid(code, msg) => {
                diag::error(code, msg.clone());
                PrefixDecodeOutcome::Failed(match code {
                    "INVALID_MAGIC" => WireError::InvalidMagic,
                    _ => WireError::InvalidFrame(msg),
                })
            }
        }
    }
}

/// Result of [`Frame::try_decode_prefix`].
#[derive(Debug)]
pub enum PrefixDecodeOutcome {
    Frame { frame: Frame, consumed: usize },
    NeedMoreData,
    Failed(WireError),
}

enum InnerOutcome {
    Ok { frame: Frame, consumed: usize },
    Underrun,
    CapExceeded,
    Invalid(&'static str, String),
}

#[derive(Debug)]
struct ReadFailure {
    underrun: bool,
}

struct CappedReader<'a> {
    data: &'a [u8],
    pos: usize,
    cap: usize,
}

impl<'a> CappedReader<'a> {
    fn new(data: &'a [u8], cap: usize) -> Self {
        Self { data, pos: 0, cap }
    }
}

impl ciborium_io::Read for CappedReader<'_> {
    type Error = ReadFailure;

    fn read_exact(&mut self, out: &mut [u8]) -> Result<(), Self::Error> {
        if self.pos.saturating_add(out.len()) > self.cap {
            return Err(ReadFailure { underrun: false });
        }
        if self.pos.saturating_add(out.len()) > self.data.len() {
            return Err(ReadFailure { underrun: true });
        }
        out.copy_from_slice(&self.data[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }
}

fn decode_inner(bytes: &[u8], max_bytes: usize) -> InnerOutcome {
    match bytes[0] {
        CANONICAL_ARRAY3 => {
            diag::warning("CANONICAL_ARRAY_HEADER", "frame uses canonical CBOR array(3) header instead of the EnergyNet sync magic");
        }
        NONCANONICAL_ARRAY_PREFIX => {
            if bytes.len() < 5 {
                return InnerOutcome::Underrun;
            }
            let declared_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            if declared_len != 3 {
                diag::warning(
                    "INVALID_ARRAY_LENGTH",
                    format!("frame magic declares array length {declared_len}, expected 3"),
                );
            }
        }
        other => {
            return InnerOutcome::Invalid(
                "INVALID_MAGIC",
                format!("unrecognized frame magic byte 0x{other:02x}"),
            );
        }
    }

    let mut reader = CappedReader::new(bytes, max_bytes);
    let top: Cbor = match ciborium::de::from_reader(&mut reader) {
        Ok(v) => v,
        Err(e) => {
            return classify_decode_error(&reader, e);
        }
    };
    let consumed = reader.pos;

    let elements = match &top {
        Cbor::Array(elems) => elems,
        _ => {
            return InnerOutcome::Invalid(
                "INVALID_FRAME".into(),
                "top-level frame value is not a CBOR array".to_string(),
            )
        }
    };
    if elements.len() != 3 {
        return InnerOutcome::Invalid(
            "INVALID_FRAME",
            format!("frame array has {} elements, expected 3", elements.len()),
        );
    }

    let headers = match decode_headers(&elements[0]) {
        Ok(h) => h,
        Err(outcome) => return outcome,
    };

    let message_type_id = match &elements[1] {
        Cbor::Integer(i) => {
            let as_i128: i128 = (*i).into();
            match u32::try_from(as_i128) {
                Ok(v) => v,
                Err(_) => {
                    return InnerOutcome::Invalid(
                        "INVALID_FRAME",
                        "message_type_id does not fit in a u32".to_string(),
                    )
                }
            }
        }
        _ => {
            return InnerOutcome::Invalid(
                "INVALID_FRAME",
                "message_type_id is not a CBOR unsigned integer".to_string(),
            )
        }
    };

    let payload = match &elements[2] {
        Cbor::Bytes(b) => b.clone(),
        _ => {
            return InnerOutcome::Invalid(
                "INVALID_FRAME",
                "payload is not a CBOR bytestring".to_string(),
            )
        }
    };

    InnerOutcome::Ok {
        frame: Frame {
            headers,
            message_type_id,
            payload,
        },
        consumed,
    }
}

fn classify_decode_error(reader: &CappedReader<'_>, err: ciborium::de::Error<ReadFailure>) -> InnerOutcome {
    if let ciborium::de::Error::Io(failure) = &err {
        return if failure.underrun {
            InnerOutcome::Underrun
        } else {
            InnerOutcome::CapExceeded
        };
    }
    // Any other ciborium decode error (malformed CBOR bytes that aren't
    // simply "ran out of input") is a structurally invalid frame.
    let _ = reader;
    InnerOutcome::Invalid("INVALID_FRAME", format!("malformed CBOR in frame: {err}"))
}

fn decode_headers(element: &Cbor) -> Result<BTreeMap<u32, Header>, InnerOutcome> {
    match element {
        Cbor::Null => Ok(BTreeMap::new()),
        Cbor::Map(pairs) => {
            let mut headers = BTreeMap::new();
            for (key, value) in pairs {
                let key_id = match key {
                    Cbor::Integer(i) => {
                        let as_i128: i128 = (*i).into();
                        u32::try_from(as_i128).ok()
                    }
                    _ => None,
                };
                let Some(key_id) = key_id else {
                    diag::warning("INVALID_HEADER_KEY", "header key is not a non-negative integer, skipping entry");
                    continue;
                };
                let header_value = match value {
                    Cbor::Text(s) => Header::Text(s.clone()),
                    Cbor::Integer(_) => match as_i64(value) {
                        Ok(i) => Header::Int(i),
                        Err(_) => {
                            diag::warning("INVALID_HEADER_VALUE", format!("header {key_id} integer out of range, skipping entry"));
                            continue;
                        }
                    },
                    Cbor::Bool(b) => Header::Bool(*b),
                    Cbor::Bytes(b) => Header::Bytes(b.clone()),
                    Cbor::Float(f) => Header::Float(*f),
                    Cbor::Null => Header::Null,
                    _ => {
                        diag::warning("INVALID_HEADER_VALUE", format!("header {key_id} has an unsupported value type, skipping entry"));
                        continue;
                    }
                };
                headers.insert(key_id, header_value);
            }
            Ok(headers)
        }
        _ => {
            diag::warning("INVALID_HEADERS_SHAPE", "headers element is neither null nor a map, treating as empty");
            Ok(BTreeMap::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use energynet_diagnostics::DiagnosticScope;

    fn sample_frame() -> Frame {
        let mut f = Frame::new(0xBABA5E55, vec![1, 2, 3, 4]);
        f.headers.insert(7, Header::Text("hello".into()));
        f
    }

    #[test]
    fn encode_starts_with_magic() {
        let bytes = sample_frame().encode().expect("encode");
        assert_eq!(&bytes[..5], &[0x9A, 0x00, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn encode_is_deterministic() {
        let f = sample_frame();
        assert_eq!(f.encode().unwrap(), f.encode().unwrap());
    }

    #[test]
    fn roundtrip_with_headers() {
        let f = sample_frame();
        let bytes = f.encode().unwrap();
        let scope = DiagnosticScope::enter();
        let (decoded, consumed) = Frame::decode(&bytes, DEFAULT_MAX_FRAME_BYTES)
            .expect("not eof")
            .expect("decode ok");
        let diags = scope.finish();
        assert!(diags.is_empty());
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, f);
    }

    #[test]
    fn roundtrip_without_headers() {
        let f = Frame::new(0xFFFFFFFF, vec![]);
        let bytes = f.encode().unwrap();
        let (decoded, _) = Frame::decode(&bytes, DEFAULT_MAX_FRAME_BYTES).unwrap().unwrap();
        assert_eq!(decoded, f);
        // empty headers encode as CBOR null (0xF6) right after the magic.
        assert_eq!(bytes[5], 0xF6);
    }

    #[test]
    fn soft_disconnect_payload_wraps_in_a_frame() {
        // The §8 scenario 2 SoftDisconnect payload bytes, wrapped as an
        // opaque frame payload (message.rs owns decoding the payload itself).
        let payload = [
            0xA2, 0x00, 0xA1, 0x01, 0xF4, 0x01, 0xA1, 0x00, 0x66, 0x6E, 0x6F, 0x72, 0x6D, 0x61,
            0x6C,
        ];
        let f = Frame::new(0xBABADEAD, payload.to_vec());
        let bytes = f.encode().unwrap();
        let (decoded, _) = Frame::decode(&bytes, DEFAULT_MAX_FRAME_BYTES).unwrap().unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn decode_returns_none_on_empty_input() {
        assert!(Frame::decode(&[], DEFAULT_MAX_FRAME_BYTES).is_none());
    }

    #[test]
    fn decode_accepts_canonical_array_header_with_warning() {
        let f = Frame::new(0x01, vec![9]);
        let mut bytes = f.encode().unwrap();
        // Replace the 5-byte magic with the canonical 1-byte form.
        bytes.splice(0..5, [0x83]);
        let scope = DiagnosticScope::enter();
        let (decoded, _) = Frame::decode(&bytes, DEFAULT_MAX_FRAME_BYTES).unwrap().unwrap();
        let diags = scope.finish();
        assert_eq!(decoded, f);
        assert!(diags.iter().any(|d| d.code == "CANONICAL_ARRAY_HEADER"));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let scope = DiagnosticScope::enter();
        let result = Frame::decode(&[0x00, 0x01, 0x02], DEFAULT_MAX_FRAME_BYTES).unwrap();
        let diags = scope.finish();
        assert!(matches!(result, Err(WireError::InvalidMagic)));
        assert!(diags.iter().any(|d| d.code == "INVALID_MAGIC"));
    }

    #[test]
    fn decode_warns_then_fails_on_wrong_declared_length() {
        let f = Frame::new(0x02, vec![1]);
        let mut bytes = f.encode().unwrap();
        bytes[1..5].copy_from_slice(&7u32.to_be_bytes());
        let scope = DiagnosticScope::enter();
        let result = Frame::decode(&bytes, DEFAULT_MAX_FRAME_BYTES).unwrap();
        let diags = scope.finish();
        // declared length 7 doesn't match the real 3-element array -> INVALID_FRAME.
        assert!(result.is_err());
        assert!(diags.iter().any(|d| d.code == "INVALID_ARRAY_LENGTH"));
    }

    #[test]
    fn decode_fails_on_truncated_input() {
        let f = sample_frame();
        let bytes = f.encode().unwrap();
        let truncated = &bytes[..bytes.len() - 2];
        let scope = DiagnosticScope::enter();
        let result = Frame::decode(truncated, DEFAULT_MAX_FRAME_BYTES).unwrap();
        let diags = scope.finish();
        assert!(matches!(result, Err(WireError::ReadError(_))));
        assert!(diags.iter().any(|d| d.code == "READ_ERROR"));
    }

    #[test]
    fn decode_fails_on_oversized_payload_without_oom() {
        let f = Frame::new(0x03, vec![0u8; 4096]);
        let bytes = f.encode().unwrap();
        let result = Frame::decode(&bytes, 128).unwrap();
        assert!(matches!(result, Err(WireError::ReadError(_))));
    }

    #[test]
    fn try_decode_prefix_reports_need_more_data() {
        let f = sample_frame();
        let bytes = f.encode().unwrap();
        let prefix = &bytes[..bytes.len() - 1];
        match Frame::try_decode_prefix(prefix, DEFAULT_MAX_FRAME_BYTES) {
            PrefixDecodeOutcome::NeedMoreData => {}
            other => panic!("expected NeedMoreData, got {other:?}"),
        }
        match Frame::try_decode_prefix(&bytes, DEFAULT_MAX_FRAME_BYTES) {
            PrefixDecodeOutcome::Frame { frame, consumed } => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(frame, f);
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    #[test]
    fn single_byte_corruption_never_panics() {
        let f = sample_frame();
        let bytes = f.encode().unwrap();
        for i in 0..bytes.len() {
            let mut mutated = bytes.clone();
            mutated[i] ^= 0xFF;
            let scope = DiagnosticScope::enter();
            let _ = Frame::decode(&mutated, DEFAULT_MAX_FRAME_BYTES);
            let _ = scope.finish();
        }
    }
}
