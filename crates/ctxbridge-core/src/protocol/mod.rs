//! Protocol modules.
//!
//! - `envelope`: the single message shape that crosses a context boundary.
//! - `codec`: envelope <-> wire value (JSON text, JSON bytes, or a structured
//!   value for transports that clone objects natively).
//! - `manifest`: the statically enumerable contract a service publishes.
//!
//! Decoding is panic-free: malformed input is reported as `BridgeError::Decode`.

pub mod codec;
pub mod envelope;
pub mod manifest;

pub use codec::{decode, encode, WireFormat, WireValue};
pub use envelope::{ClientId, Envelope, Kind, StreamEnd};
pub use manifest::{Descriptor, ServiceManifest};
