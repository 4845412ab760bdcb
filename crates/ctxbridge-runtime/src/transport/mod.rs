//! Transport layer: physical channels and the adapter that puts the envelope
//! codec in front of them.
//!
//! - `channel`: the `Channel` contract plus an in-memory implementation.
//! - `adapter`: `TransportAdapter` (encode on send, decode-then-dispatch on
//!   receive, one bound receiver).

pub mod adapter;
pub mod channel;

pub use adapter::{EnvelopeSink, TransportAdapter};
pub use channel::{memory_pair, Channel, MemoryChannel};
