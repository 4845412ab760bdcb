//! Envelope: the only entity that crosses the transport boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RemoteError, Result};

/// Connection-scoped client identity assigned by the service at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Envelope kind (field name is `kind` in JSON, values are kebab-case).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    Connect,
    ConnectAck,
    Disconnect,
    Call,
    Result,
    Error,
    StreamOpen,
    StreamData,
    StreamPull,
    StreamEnd,
    Event,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Connect => "connect",
            Kind::ConnectAck => "connect-ack",
            Kind::Disconnect => "disconnect",
            Kind::Call => "call",
            Kind::Result => "result",
            Kind::Error => "error",
            Kind::StreamOpen => "stream-open",
            Kind::StreamData => "stream-data",
            Kind::StreamPull => "stream-pull",
            Kind::StreamEnd => "stream-end",
            Kind::Event => "event",
        }
    }
}

/// One message between a client context and a service context.
///
/// `id` correlates a request with its terminal envelope and is absent on
/// events. `client_id` is absent only on the initial `connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    fn bare(service: &str, kind: Kind) -> Self {
        Self {
            id: None,
            service_name: service.to_string(),
            client_id: None,
            kind,
            name: None,
            payload: Value::Null,
        }
    }

    /// Handshake request. A `connect` has no `id`; the optional `nonce`
    /// travels as `{"nonce": n}` in the payload and comes back as the `id`
    /// of the `connect-ack` (or rejecting `error`).
    pub fn connect(service: &str, nonce: Option<u64>) -> Self {
        Self {
            payload: nonce.map_or(Value::Null, |n| serde_json::json!({ "nonce": n })),
            ..Self::bare(service, Kind::Connect)
        }
    }

    pub fn connect_ack(service: &str, nonce: Option<u64>, client: &ClientId, manifest: Value) -> Self {
        Self {
            id: nonce,
            client_id: Some(client.clone()),
            payload: manifest,
            ..Self::bare(service, Kind::ConnectAck)
        }
    }

    /// Connect rejection: an `error` in place of the `connect-ack`.
    pub fn connect_rejected(service: &str, nonce: Option<u64>, err: &RemoteError) -> Self {
        Self {
            id: nonce,
            payload: remote_to_value(err),
            ..Self::bare(service, Kind::Error)
        }
    }

    pub fn disconnect(service: &str, client: &ClientId) -> Self {
        Self {
            client_id: Some(client.clone()),
            ..Self::bare(service, Kind::Disconnect)
        }
    }

    pub fn call(service: &str, client: &ClientId, id: u64, name: &str, args: Value) -> Self {
        Self {
            id: Some(id),
            client_id: Some(client.clone()),
            name: Some(name.to_string()),
            payload: args,
            ..Self::bare(service, Kind::Call)
        }
    }

    pub fn result(service: &str, client: &ClientId, id: u64, value: Value) -> Self {
        Self {
            id: Some(id),
            client_id: Some(client.clone()),
            payload: value,
            ..Self::bare(service, Kind::Result)
        }
    }

    pub fn error(service: &str, client: &ClientId, id: u64, err: &RemoteError) -> Self {
        Self {
            id: Some(id),
            client_id: Some(client.clone()),
            payload: remote_to_value(err),
            ..Self::bare(service, Kind::Error)
        }
    }

    pub fn stream_open(service: &str, client: &ClientId, id: u64, name: &str, args: Value) -> Self {
        Self {
            kind: Kind::StreamOpen,
            ..Self::call(service, client, id, name, args)
        }
    }

    pub fn stream_data(service: &str, client: &ClientId, id: u64, item: Value) -> Self {
        Self {
            kind: Kind::StreamData,
            ..Self::result(service, client, id, item)
        }
    }

    pub fn stream_pull(service: &str, client: &ClientId, id: u64) -> Self {
        Self {
            kind: Kind::StreamPull,
            ..Self::result(service, client, id, Value::Null)
        }
    }

    pub fn stream_end(service: &str, client: &ClientId, id: u64, end: &StreamEnd) -> Self {
        let payload = serde_json::to_value(end).unwrap_or(Value::Null);
        Self {
            kind: Kind::StreamEnd,
            ..Self::result(service, client, id, payload)
        }
    }

    pub fn event(service: &str, client: &ClientId, name: &str, detail: Value) -> Self {
        Self {
            client_id: Some(client.clone()),
            name: Some(name.to_string()),
            payload: detail,
            ..Self::bare(service, Kind::Event)
        }
    }

    /// `name` or an empty string, for logging and lookups.
    pub fn name_str(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Handshake nonce of a `connect`, if the client sent one.
    pub fn connect_nonce(&self) -> Option<u64> {
        self.payload.get("nonce").and_then(Value::as_u64)
    }

    /// Interpret the payload of an `error` envelope.
    pub fn remote_error(&self) -> RemoteError {
        serde_json::from_value(self.payload.clone()).unwrap_or_else(|e| RemoteError {
            kind: crate::error::ErrorKind::Internal,
            message: format!("malformed error payload: {e}"),
        })
    }

    /// Interpret the payload of a `stream-end` envelope.
    pub fn stream_end_payload(&self) -> Result<StreamEnd> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| crate::error::BridgeError::Decode(format!("invalid stream-end payload: {e}")))
    }
}

fn remote_to_value(err: &RemoteError) -> Value {
    serde_json::to_value(err).unwrap_or(Value::Null)
}

/// Terminal outcome of a stream: `{ok:true}` or `{ok:false, error:{kind,message}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl StreamEnd {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failed(err: RemoteError) -> Self {
        Self {
            ok: false,
            error: Some(err),
        }
    }
}
