//! ctxbridge core: transport-agnostic protocol primitives and error types.
//!
//! This crate defines the envelope that crosses a context boundary, the codec
//! that turns it into a wire value, the published service manifest, and the
//! pull-based stream state machine shared by both ends of a stream. It carries
//! no runtime dependencies so the same contracts can be used by the service
//! host, the client proxy, and test tooling.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! Malformed wire values surface as `BridgeError::Decode` so a dispatch loop
//! never crashes on bad traffic.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod flow;
pub mod protocol;

/// Shared result type.
pub use error::{BridgeError, ErrorKind, RemoteError, Result};
