//! Top-level facade crate for ctxbridge.
//!
//! Re-exports the protocol core and the runtime so users can depend on a single crate.

pub mod core {
    pub use ctxbridge_core::*;
}

pub mod runtime {
    pub use ctxbridge_runtime::*;
}

pub use ctxbridge_core::{BridgeError, ErrorKind, Result};
pub use ctxbridge_runtime::{ClientProxy, ServiceDefinition, ServiceRegistry};
