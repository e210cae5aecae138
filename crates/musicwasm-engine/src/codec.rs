//! Binary call codec.
//!
//! Every frame crossing the host/module boundary is
//!   [4-byte big-endian length] [CBOR payload]
//!
//! Requests are [`Command`]s wrapping a [`CallEnvelope`]. Responses are
//! decoded into whatever message type the caller expects for the call it made.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

use serde::de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::call_id::CallerId;
use crate::error::{EngineError, Result};
use crate::messages::ModuleEvent;

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Content type announced to modules for CBOR-framed calls.
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";

// ─── Argument values ────────────────────────────────────────────────────

/// Structured argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Map(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    /// Reject values the wire format cannot carry faithfully.
    fn validate(&self, path: &str) -> Result<()> {
        match self {
            ArgValue::Number(n) if !n.is_finite() => Err(EngineError::Encoding(format!(
                "argument '{path}' is not a finite number: {n}"
            ))),
            ArgValue::Map(fields) => {
                for (key, value) in fields {
                    value.validate(&format!("{path}.{key}"))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::String(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::String(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Number(value)
    }
}

impl From<BTreeMap<String, ArgValue>> for ArgValue {
    fn from(value: BTreeMap<String, ArgValue>) -> Self {
        ArgValue::Map(value)
    }
}

impl TryFrom<serde_json::Value> for ArgValue {
    type Error = EngineError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        match value {
            Value::Null => Ok(ArgValue::Null),
            Value::Bool(b) => Ok(ArgValue::Bool(b)),
            Value::Number(n) => n
                .as_f64()
                .map(ArgValue::Number)
                .ok_or_else(|| EngineError::Encoding(format!("unsupported number: {n}"))),
            Value::String(s) => Ok(ArgValue::String(s)),
            Value::Array(_) => Err(EngineError::Encoding(
                "array arguments are not supported".into(),
            )),
            Value::Object(fields) => fields
                .into_iter()
                .map(|(k, v)| Ok((k, ArgValue::try_from(v)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(ArgValue::Map),
        }
    }
}

impl Serialize for ArgValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ArgValue::Null => serializer.serialize_unit(),
            ArgValue::Bool(b) => serializer.serialize_bool(*b),
            ArgValue::Number(n) => serializer.serialize_f64(*n),
            ArgValue::String(s) => serializer.serialize_str(s),
            ArgValue::Map(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in fields {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

struct ArgValueVisitor;

impl<'de> Visitor<'de> for ArgValueVisitor {
    type Value = ArgValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("null, bool, number, string or map")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<ArgValue, E> {
        Ok(ArgValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<ArgValue, E> {
        Ok(ArgValue::Null)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<ArgValue, E> {
        Ok(ArgValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<ArgValue, E> {
        Ok(ArgValue::Number(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<ArgValue, E> {
        Ok(ArgValue::Number(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<ArgValue, E> {
        Ok(ArgValue::Number(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ArgValue, E> {
        Ok(ArgValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<ArgValue, E> {
        Ok(ArgValue::String(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, _seq: A) -> std::result::Result<ArgValue, A::Error> {
        Err(de::Error::custom("array arguments are not supported"))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<ArgValue, A::Error> {
        let mut fields = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, ArgValue>()? {
            fields.insert(key, value);
        }
        Ok(ArgValue::Map(fields))
    }
}

impl<'de> Deserialize<'de> for ArgValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ArgValueVisitor)
    }
}

// ─── Envelope & command ─────────────────────────────────────────────────

/// A call id plus its named arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub id: String,
    #[serde(default)]
    pub args: BTreeMap<String, ArgValue>,
}

impl CallEnvelope {
    pub fn new<C: CallerId>(id: C) -> Self {
        Self {
            id: id.to_call_id(),
            args: BTreeMap::new(),
        }
    }

    /// Add a required argument.
    pub fn arg(mut self, name: &str, value: impl Into<ArgValue>) -> Self {
        self.args.insert(name.to_string(), value.into());
        self
    }

    /// Add an optional string argument only when it is present and non-empty.
    pub fn optional_arg(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => self.arg(name, v),
            _ => self,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Call,
}

/// Per-call options the module reads alongside the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    pub content_type: String,
    pub bundle_id: String,
    pub device_id: String,
    pub country_code: String,
    pub language_code: String,
    pub premium: bool,
    pub extra: BTreeMap<String, ArgValue>,
}

/// The complete request frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub request_id: String,
    pub kind: CommandKind,
    pub call: CallEnvelope,
    pub options: CallOptions,
}

impl Command {
    pub fn call(call: CallEnvelope, options: CallOptions) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            kind: CommandKind::Call,
            call,
            options,
        }
    }
}

// ─── Framing ────────────────────────────────────────────────────────────

fn frame(payload: Vec<u8>) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| EngineError::Encoding(format!("payload too large: {} bytes", payload.len())))?;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn unframe(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(EngineError::MalformedResponse(format!(
            "frame too short: {} bytes",
            bytes.len()
        )));
    }
    let (header, payload) = bytes.split_at(FRAME_HEADER_LEN);
    let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if declared != payload.len() {
        return Err(EngineError::MalformedResponse(format!(
            "frame length mismatch: header says {declared}, got {}",
            payload.len()
        )));
    }
    Ok(payload)
}

// ─── Encode / decode ────────────────────────────────────────────────────

/// Encode any serializable message as a frame.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(message, &mut payload)
        .map_err(|e| EngineError::Encoding(e.to_string()))?;
    frame(payload)
}

/// Encode a call command, validating every argument first.
pub fn encode(command: &Command) -> Result<Vec<u8>> {
    for (name, value) in &command.call.args {
        value.validate(name)?;
    }
    for (name, value) in &command.options.extra {
        value.validate(name)?;
    }
    encode_message(command)
}

/// Decode a frame into the message type expected for the call.
///
/// Bad framing or invalid CBOR is a [`EngineError::MalformedResponse`];
/// well-formed CBOR that is not a `T` is a [`EngineError::Decoding`], unless
/// the module answered with a [`ModuleEvent::Error`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let payload = unframe(bytes)?;
    let mut cursor = Cursor::new(payload);
    let value: ciborium::Value = ciborium::de::from_reader(&mut cursor)
        .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;

    let consumed = cursor.position() as usize;
    if consumed != payload.len() {
        return Err(EngineError::MalformedResponse(format!(
            "{} trailing bytes after message",
            payload.len() - consumed
        )));
    }

    if let Ok(ModuleEvent::Error { code, reason }) = value.deserialized::<ModuleEvent>() {
        return Err(EngineError::Module { code, reason });
    }

    value.deserialized::<T>().map_err(|e| {
        EngineError::Decoding(format!(
            "expected {}: {e}",
            std::any::type_name::<T>()
        ))
    })
}
