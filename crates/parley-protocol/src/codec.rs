//! JSON framing shared by both protocols.
//!
//! Decoding is two-step: first the `type` discriminator is read from the raw
//! object, then the object is decoded into the concrete enum. This lets
//! callers tell an unknown message type apart from a known type with bad
//! fields.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Read the `type` discriminator of a JSON message.
pub fn message_type(text: &str) -> Result<(Value, String)> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("message is not a JSON object".into()))?
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing string field `type`".into()))?
        .to_string();
    Ok((value, kind))
}

/// Decode a message whose `type` must be one of `known`.
pub fn decode_tagged<T: DeserializeOwned>(text: &str, known: &[&str]) -> Result<T> {
    let (value, kind) = message_type(text)?;
    if !known.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a message as a compact JSON string.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}
