//! ctxbridge runtime library entry.
//!
//! This crate wires the transport adapter, service registry, lifecycle
//! manager, and client proxy into a working RPC layer on tokio. It is
//! intended to be consumed by the demo binary (`main.rs`), by the facade
//! crate, and by integration tests.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod obs;
pub mod services;
pub mod transport;

pub use client::{ClientProxy, StreamReceiver};
pub use dispatch::{CallContext, ServiceDefinition, ServiceRegistry, StreamSink};
pub use transport::{memory_pair, TransportAdapter};
