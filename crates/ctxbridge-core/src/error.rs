//! Shared error type across ctxbridge crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes carried on the wire inside `error` and `stream-end`
/// envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A service with the same name is already registered.
    DuplicateService,
    /// The called method is not part of the service.
    UnknownMethod,
    /// The opened stream is not part of the service.
    UnknownStream,
    /// A handler failed.
    HandlerError,
    /// The client's connection went away while the request was outstanding.
    Disconnected,
    /// A wire value could not be decoded into an envelope.
    DecodeError,
    /// The service refused a new client.
    CapacityExceeded,
    /// The peer broke the envelope ordering rules.
    ProtocolError,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// String representation used on the wire and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DuplicateService => "DuplicateService",
            ErrorKind::UnknownMethod => "UnknownMethod",
            ErrorKind::UnknownStream => "UnknownStream",
            ErrorKind::HandlerError => "HandlerError",
            ErrorKind::Disconnected => "Disconnected",
            ErrorKind::DecodeError => "DecodeError",
            ErrorKind::CapacityExceeded => "CapacityExceeded",
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Unified error type used by core and runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("service already registered: {0}")]
    DuplicateService(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("unknown stream: {0}")]
    UnknownStream(String),
    #[error("handler failed ({kind}): {message}")]
    Handler { kind: ErrorKind, message: String },
    #[error("disconnected")]
    Disconnected,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("capacity exceeded for service {0}")]
    CapacityExceeded(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("receive handler already bound")]
    AlreadyBound,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("unsupported config version")]
    UnsupportedVersion,
    #[error("internal: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Plain handler failure with a free-form message.
    pub fn handler(message: impl Into<String>) -> Self {
        BridgeError::Handler {
            kind: ErrorKind::HandlerError,
            message: message.into(),
        }
    }

    /// Map to the stable code sent to the remote side.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::DuplicateService(_) => ErrorKind::DuplicateService,
            BridgeError::UnknownMethod(_) => ErrorKind::UnknownMethod,
            BridgeError::UnknownStream(_) => ErrorKind::UnknownStream,
            BridgeError::Handler { kind, .. } => *kind,
            BridgeError::Disconnected | BridgeError::ChannelClosed => ErrorKind::Disconnected,
            BridgeError::Decode(_) => ErrorKind::DecodeError,
            BridgeError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            BridgeError::Protocol(_) => ErrorKind::ProtocolError,
            BridgeError::Encode(_)
            | BridgeError::AlreadyBound
            | BridgeError::Config(_)
            | BridgeError::UnsupportedVersion
            | BridgeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Structured `{kind, message}` form for the wire.
    pub fn to_remote(&self) -> RemoteError {
        let message = match self {
            BridgeError::UnknownMethod(n)
            | BridgeError::UnknownStream(n)
            | BridgeError::DuplicateService(n)
            | BridgeError::CapacityExceeded(n) => n.clone(),
            BridgeError::Handler { message, .. } => message.clone(),
            other => other.to_string(),
        };
        RemoteError {
            kind: self.kind(),
            message,
        }
    }
}

/// Error payload carried by `error` envelopes and failed `stream-end`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<RemoteError> for BridgeError {
    fn from(e: RemoteError) -> Self {
        match e.kind {
            ErrorKind::DuplicateService => BridgeError::DuplicateService(e.message),
            ErrorKind::UnknownMethod => BridgeError::UnknownMethod(e.message),
            ErrorKind::UnknownStream => BridgeError::UnknownStream(e.message),
            ErrorKind::Disconnected => BridgeError::Disconnected,
            ErrorKind::DecodeError => BridgeError::Decode(e.message),
            ErrorKind::CapacityExceeded => BridgeError::CapacityExceeded(e.message),
            ErrorKind::ProtocolError => BridgeError::Protocol(e.message),
            kind @ (ErrorKind::HandlerError | ErrorKind::Internal) => BridgeError::Handler {
                kind,
                message: e.message,
            },
        }
    }
}
