//! Envelope codec: envelope <-> transport wire value.
//!
//! Transports differ in what they can carry: some only move strings, some move
//! raw bytes, some structurally clone objects. `WireValue` covers all three so
//! nothing above the codec needs to care which one is in use.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{BridgeError, Result};
use crate::protocol::envelope::Envelope;

/// Wire representation chosen by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON text.
    #[default]
    Text,
    /// UTF-8 JSON bytes.
    Bytes,
    /// Structured value (structured-clone style transports).
    Structured,
}

/// One value as it travels over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Text(String),
    Bytes(Bytes),
    Structured(Value),
}

impl WireValue {
    /// Encoded size in bytes (structured values report 0).
    pub fn len(&self) -> usize {
        match self {
            WireValue::Text(s) => s.len(),
            WireValue::Bytes(b) => b.len(),
            WireValue::Structured(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode an envelope for the given wire format.
pub fn encode(env: &Envelope, format: WireFormat) -> Result<WireValue> {
    match format {
        WireFormat::Text => serde_json::to_string(env)
            .map(WireValue::Text)
            .map_err(|e| BridgeError::Encode(format!("json encode failed: {e}"))),
        WireFormat::Bytes => serde_json::to_vec(env)
            .map(|v| WireValue::Bytes(Bytes::from(v)))
            .map_err(|e| BridgeError::Encode(format!("json encode failed: {e}"))),
        WireFormat::Structured => serde_json::to_value(env)
            .map(WireValue::Structured)
            .map_err(|e| BridgeError::Encode(format!("json encode failed: {e}"))),
    }
}

/// Decode a wire value. Values missing `kind` or `serviceName` are rejected.
pub fn decode(wire: WireValue) -> Result<Envelope> {
    let value: Value = match wire {
        WireValue::Text(s) => serde_json::from_str(&s)
            .map_err(|e| BridgeError::Decode(format!("invalid envelope json: {e}")))?,
        WireValue::Bytes(b) => serde_json::from_slice(&b)
            .map_err(|e| BridgeError::Decode(format!("invalid envelope json: {e}")))?,
        WireValue::Structured(v) => v,
    };

    let Some(obj) = value.as_object() else {
        tracing::debug!(value = %value, "envelope rejected: not an object");
        return Err(BridgeError::Decode("envelope must be an object".into()));
    };
    for required in ["kind", "serviceName"] {
        if !obj.contains_key(required) {
            tracing::debug!(field = required, "envelope rejected: missing field");
            return Err(BridgeError::Decode(format!("missing field `{required}`")));
        }
    }

    serde_json::from_value(value).map_err(|e| {
        tracing::debug!(error = %e, "envelope rejected: bad field");
        BridgeError::Decode(format!("invalid envelope: {e}"))
    })
}
