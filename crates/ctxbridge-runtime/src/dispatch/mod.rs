//! Service-side dispatch.
//!
//! Re-exports the registry, service definitions, handler traits, and the
//! stream sink so downstream consumers can depend on this module directly.

pub mod context;
pub mod registry;
pub mod service;
pub mod stream;

pub use context::CallContext;
pub use registry::ServiceRegistry;
pub use service::{MethodHandler, ServiceBuilder, ServiceDefinition, StreamHandler};
pub use stream::StreamSink;
