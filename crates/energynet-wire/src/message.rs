//! The closed set of protocol messages and the lenient/strict parsing
//! registry (§4.3, §6).
//!
//! Every message payload is itself a CBOR map keyed by small field IDs
//! (not the type-id tagging of [`crate::value::Value`]): `{fieldId:
//! Value::encode()}`. Fields absent on a variant are simply omitted from
//! the map, never encoded as CBOR null.

use std::collections::BTreeMap;

use ciborium::value::{Integer, Value as Cbor};

use energynet_diagnostics::{self as diag, Diagnostic, DiagnosticScope};

use crate::value::{as_u64, Bounds, EnergyMix, IsolationState, PriceForecast, SourceMix, Value};
use crate::WireError;

pub const TYPE_PING: u32 = 0xFFFF_FFFF;
pub const TYPE_SESSION_PARAMETERS: u32 = 0xBABA_5E55;
pub const TYPE_SOFT_DISCONNECT: u32 = 0xBABA_DEAD;
pub const TYPE_SUPPLY_PARAMETERS: u32 = 0xDCDC_F00D;
pub const TYPE_DEMAND_PARAMETERS: u32 = 0xDCDC_FEED;
pub const TYPE_STORAGE_PARAMETERS: u32 = 0xDCDC_BA77;

/// Identity and capability fields exchanged during the handshake (§6).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionParameters {
    pub identity: String,
    pub r#type: Option<String>,
    pub version: Option<String>,
    pub name: Option<String>,
    pub tenant: Option<String>,
    pub provider: Option<String>,
    pub session: Option<String>,
}

/// Graceful-teardown notice (§6).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SoftDisconnect {
    pub reconnect: Option<bool>,
    pub reason: Option<String>,
}

/// Supply-side operating parameters (§6).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SupplyParameters {
    pub voltage_limits: Option<Bounds>,
    pub current_limits: Option<Bounds>,
    pub power_limit: Option<f64>,
    pub power_mix: Option<SourceMix>,
    pub energy_prices: Option<PriceForecast>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub isolation: Option<IsolationState>,
}

/// Demand-side operating parameters (§6).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DemandParameters {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub voltage_limits: Option<Bounds>,
    pub current_limits: Option<Bounds>,
    pub power_limit: Option<f64>,
    pub duration: Option<i64>,
}

/// Storage-side operating parameters (§6).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageParameters {
    pub soc: Option<f64>,
    pub soc_target: Option<f64>,
    pub soc_target_time: Option<chrono::DateTime<chrono::Utc>>,
    pub capacity: Option<f64>,
    pub energy_mix: Option<EnergyMix>,
}

/// The closed set of protocol messages (§3, §6).
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Ping,
    SessionParameters(SessionParameters),
    SoftDisconnect(SoftDisconnect),
    SupplyParameters(SupplyParameters),
    DemandParameters(DemandParameters),
    StorageParameters(StorageParameters),
    /// A syntactically valid frame payload whose `message_type_id` is not
    /// in the registry (§4.3). Lenient-mode default.
    UnknownMessage { type_id: u32, raw_payload: Vec<u8> },
}

impl Message {
    pub fn type_id(&self) -> u32 {
        match self {
            Message::Ping => TYPE_PING,
            Message::SessionParameters(_) => TYPE_SESSION_PARAMETERS,
            Message::SoftDisconnect(_) => TYPE_SOFT_DISCONNECT,
            Message::SupplyParameters(_) => TYPE_SUPPLY_PARAMETERS,
            Message::DemandParameters(_) => TYPE_DEMAND_PARAMETERS,
            Message::StorageParameters(_) => TYPE_STORAGE_PARAMETERS,
            Message::UnknownMessage { type_id, .. } => *type_id,
        }
    }

    /// Encode this message to its CBOR payload bytes (the bytes that go
    /// into a [`crate::Frame`]'s `payload` field).
    pub fn encode_payload(&self) -> Vec<u8> {
        let cbor = match self {
            Message::Ping => Cbor::Map(vec![]),
            Message::SessionParameters(p) => {
                let mut fields = field_map();
                fields.put_text(0, &Some(p.identity.clone()));
                fields.put_text(1, &p.r#type);
                fields.put_text(2, &p.version);
                fields.put_text(3, &p.name);
                fields.put_text(4, &p.tenant);
                fields.put_text(5, &p.provider);
                fields.put_text(6, &p.session);
                fields.into_cbor()
            }
            Message::SoftDisconnect(p) => {
                let mut fields = field_map();
                fields.put_flag(0, &p.reconnect);
                fields.put_text(1, &p.reason);
                fields.into_cbor()
            }
            Message::SupplyParameters(p) => {
                let mut fields = field_map();
                fields.put_bounds(0, &p.voltage_limits);
                fields.put_bounds(1, &p.current_limits);
                fields.put(2, p.power_limit.map(Value::Power));
                fields.put(3, p.power_mix.clone().map(Value::SourceMix));
                fields.put(4, p.energy_prices.clone().map(Value::PriceForecast));
                fields.put(5, p.voltage.map(Value::Voltage));
                fields.put(6, p.current.map(Value::Current));
                fields.put(7, p.isolation.clone().map(Value::IsolationState));
                fields.into_cbor()
            }
            Message::DemandParameters(p) => {
                let mut fields = field_map();
                fields.put(0, p.voltage.map(Value::Voltage));
                fields.put(1, p.current.map(Value::Current));
                fields.put_bounds(2, &p.voltage_limits);
                fields.put_bounds(3, &p.current_limits);
                fields.put(4, p.power_limit.map(Value::Power));
                fields.put(5, p.duration.map(Value::Duration));
                fields.into_cbor()
            }
            Message::StorageParameters(p) => {
                let mut fields = field_map();
                fields.put(0, p.soc.map(Value::Percentage));
                fields.put(1, p.soc_target.map(Value::Percentage));
                fields.put(2, p.soc_target_time.map(Value::Timestamp));
                fields.put(3, p.capacity.map(Value::Energy));
                fields.put(4, p.energy_mix.clone().map(Value::EnergyMix));
                fields.into_cbor()
            }
            Message::UnknownMessage { .. } => unreachable!("UnknownMessage is never re-encoded"),
        };
        let mut buf = Vec::new();
        // A payload encode failure here would mean ciborium itself cannot
        // serialize a well-formed Value tree, which never happens for the
        // values this module constructs.
        ciborium::into_writer(&cbor, &mut buf).unwrap_or_default();
        buf
    }

    /// Decode a message from a frame's `(message_type_id, payload)` pair
    /// (§4.3). Never fails outright: value-codec problems are reported as
    /// a `PARSE_ERROR` diagnostic and degrade the affected field to
    /// absent rather than aborting the whole message.
    fn decode(type_id: u32, payload: &[u8]) -> Message {
        if type_id == TYPE_PING {
            return Message::Ping;
        }

        let fields = match decode_field_map(payload) {
            Ok(f) => f,
            Err(_) => {
                diag::error("PARSE_ERROR", "message payload is not a CBOR map");
                return Message::UnknownMessage {
                    type_id,
                    raw_payload: payload.to_vec(),
                };
            }
        };

        match type_id {
            TYPE_SESSION_PARAMETERS => {
                let Some(identity) = fields.text(0) else {
                    diag::error("PARSE_ERROR", "SessionParameters missing required field 0 (identity)");
                    return Message::UnknownMessage {
                        type_id,
                        raw_payload: payload.to_vec(),
                    };
                };
                Message::SessionParameters(SessionParameters {
                    identity,
                    r#type: fields.text(1),
                    version: fields.text(2),
                    name: fields.text(3),
                    tenant: fields.text(4),
                    provider: fields.text(5),
                    session: fields.text(6),
                })
            }
            TYPE_SOFT_DISCONNECT => Message::SoftDisconnect(SoftDisconnect {
                reconnect: fields.flag(0),
                reason: fields.text(1),
            }),
            TYPE_SUPPLY_PARAMETERS => Message::SupplyParameters(SupplyParameters {
                voltage_limits: fields.bounds(0),
                current_limits: fields.bounds(1),
                power_limit: fields.power(2),
                power_mix: fields.source_mix(3),
                energy_prices: fields.price_forecast(4),
                voltage: fields.voltage(5),
                current: fields.current(6),
                isolation: fields.isolation_state(7),
            }),
            TYPE_DEMAND_PARAMETERS => Message::DemandParameters(DemandParameters {
                voltage: fields.voltage(0),
                current: fields.current(1),
                voltage_limits: fields.bounds(2),
                current_limits: fields.bounds(3),
                power_limit: fields.power(4),
                duration: fields.duration(5),
            }),
            TYPE_STORAGE_PARAMETERS => Message::StorageParameters(StorageParameters {
                soc: fields.percentage(0),
                soc_target: fields.percentage(1),
                soc_target_time: fields.timestamp(2),
                capacity: fields.energy(3),
                energy_mix: fields.energy_mix(4),
            }),
            other => {
                diag::warning("UNKNOWN_MESSAGE_TYPE", format!("unrecognized message type id 0x{other:08x}"));
                Message::UnknownMessage {
                    type_id,
                    raw_payload: payload.to_vec(),
                }
            }
        }
    }
}

/// How [`parse`] treats warnings produced while decoding a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseMode {
    /// Unknown types and recoverable field problems are warnings; the
    /// parse still succeeds.
    Lenient,
    /// Every warning the lenient parser would have produced is promoted
    /// to an error and the parse is forced to fail (§4.3).
    Strict,
}

/// Outcome of parsing one message payload (§4.3, §7): parsing never
/// throws, it only ever produces one of these two shapes.
#[derive(Clone, Debug)]
pub enum ParseOutcome {
    Success {
        message: Message,
        diagnostics: Vec<Diagnostic>,
    },
    Failure {
        diagnostics: Vec<Diagnostic>,
    },
}

impl ParseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ParseOutcome::Success { .. })
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            ParseOutcome::Success { diagnostics, .. } => diagnostics,
            ParseOutcome::Failure { diagnostics } => diagnostics,
        }
    }
}

/// Parse one message payload under the given [`ParseMode`] (§4.3).
pub fn parse(type_id: u32, payload: &[u8], mode: ParseMode) -> ParseOutcome {
    let scope = DiagnosticScope::enter();
    let message = Message::decode(type_id, payload);
    let mut collected = scope.finish();

    if mode == ParseMode::Strict {
        collected.promote_warnings_to_errors();
    }

    if collected.has_errors() {
        ParseOutcome::Failure {
            diagnostics: collected.into_vec(),
        }
    } else {
        ParseOutcome::Success {
            message,
            diagnostics: collected.into_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Field-map helpers
// ---------------------------------------------------------------------------

struct FieldMapBuilder {
    entries: Vec<(u32, Cbor)>,
}

fn field_map() -> FieldMapBuilder {
    FieldMapBuilder { entries: Vec::new() }
}

impl FieldMapBuilder {
    fn put(&mut self, field_id: u32, value: Option<Value>) {
        if let Some(v) = value {
            self.entries.push((field_id, v.encode()));
        }
    }

    fn put_text(&mut self, field_id: u32, value: &Option<String>) {
        if let Some(s) = value {
            self.entries.push((field_id, Value::Text(s.clone()).encode()));
        }
    }

    fn put_flag(&mut self, field_id: u32, value: &Option<bool>) {
        if let Some(b) = value {
            self.entries.push((field_id, Value::Flag(*b).encode()));
        }
    }

    fn put_bounds(&mut self, field_id: u32, value: &Option<Bounds>) {
        if let Some(b) = value {
            self.entries.push((field_id, Value::Bounds(b.clone()).encode()));
        }
    }

    fn into_cbor(self) -> Cbor {
        Cbor::Map(
            self.entries
                .into_iter()
                .map(|(k, v)| (Cbor::Integer(Integer::from(k)), v))
                .collect(),
        )
    }
}

struct DecodedFields {
    fields: BTreeMap<u32, Cbor>,
}

fn decode_field_map(payload: &[u8]) -> Result<DecodedFields, WireError> {
    let cbor: Cbor = ciborium::de::from_reader(payload)
        .map_err(|e| WireError::InvalidFrame(format!("malformed message payload: {e}")))?;
    let Cbor::Map(pairs) = cbor else {
        return Err(WireError::UnexpectedShape("message payload is not a CBOR map"));
    };
    let mut fields = BTreeMap::new();
    for (key, value) in pairs {
        let Ok(field_id) = as_u64(&key) else {
            diag::warning("INVALID_FIELD_KEY", "message field key is not a non-negative integer, skipping");
            continue;
        };
        let Ok(field_id) = u32::try_from(field_id) else {
            diag::warning("INVALID_FIELD_KEY", "message field key exceeds u32 range, skipping");
            continue;
        };
        fields.insert(field_id, value);
    }
    Ok(DecodedFields { fields })
}

impl DecodedFields {
    fn value(&self, field_id: u32) -> Option<Value> {
        let cbor = self.fields.get(&field_id)?;
        match Value::decode(cbor) {
            Ok(v) => Some(v),
            Err(e) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} failed to decode: {e}"));
                None
            }
        }
    }

    fn text(&self, field_id: u32) -> Option<String> {
        match self.value(field_id) {
            Some(Value::Text(s)) => Some(s),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a Text value"));
                None
            }
            None => None,
        }
    }

    fn flag(&self, field_id: u32) -> Option<bool> {
        match self.value(field_id) {
            Some(Value::Flag(b)) => Some(b),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a Flag value"));
                None
            }
            None => None,
        }
    }

    fn bounds(&self, field_id: u32) -> Option<Bounds> {
        match self.value(field_id) {
            Some(Value::Bounds(b)) => Some(b),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a Bounds value"));
                None
            }
            None => None,
        }
    }

    fn voltage(&self, field_id: u32) -> Option<f64> {
        match self.value(field_id) {
            Some(Value::Voltage(v)) => Some(v),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a Voltage value"));
                None
            }
            None => None,
        }
    }

    fn current(&self, field_id: u32) -> Option<f64> {
        match self.value(field_id) {
            Some(Value::Current(v)) => Some(v),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a Current value"));
                None
            }
            None => None,
        }
    }

    fn power(&self, field_id: u32) -> Option<f64> {
        match self.value(field_id) {
            Some(Value::Power(v)) => Some(v),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a Power value"));
                None
            }
            None => None,
        }
    }

    fn energy(&self, field_id: u32) -> Option<f64> {
        match self.value(field_id) {
            Some(Value::Energy(v)) => Some(v),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not an Energy value"));
                None
            }
            None => None,
        }
    }

    fn percentage(&self, field_id: u32) -> Option<f64> {
        match self.value(field_id) {
            Some(Value::Percentage(v)) => Some(v),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a Percentage value"));
                None
            }
            None => None,
        }
    }

    fn duration(&self, field_id: u32) -> Option<i64> {
        match self.value(field_id) {
            Some(Value::Duration(v)) => Some(v),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a Duration value"));
                None
            }
            None => None,
        }
    }

    fn timestamp(&self, field_id: u32) -> Option<chrono::DateTime<chrono::Utc>> {
        match self.value(field_id) {
            Some(Value::Timestamp(v)) => Some(v),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a Timestamp value"));
                None
            }
            None => None,
        }
    }

    fn source_mix(&self, field_id: u32) -> Option<SourceMix> {
        match self.value(field_id) {
            Some(Value::SourceMix(m)) => Some(m),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a SourceMix value"));
                None
            }
            None => None,
        }
    }

    fn energy_mix(&self, field_id: u32) -> Option<EnergyMix> {
        match self.value(field_id) {
            Some(Value::EnergyMix(m)) => Some(m),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not an EnergyMix value"));
                None
            }
            None => None,
        }
    }

    fn price_forecast(&self, field_id: u32) -> Option<PriceForecast> {
        match self.value(field_id) {
            Some(Value::PriceForecast(p)) => Some(p),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not a PriceForecast value"));
                None
            }
            None => None,
        }
    }

    fn isolation_state(&self, field_id: u32) -> Option<IsolationState> {
        match self.value(field_id) {
            Some(Value::IsolationState(s)) => Some(s),
            Some(_) => {
                diag::warning("PARSE_ERROR", format!("field {field_id} is not an IsolationState value"));
                None
            }
            None => None,
        }
    }
}
