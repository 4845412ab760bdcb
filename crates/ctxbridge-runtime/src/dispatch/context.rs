use std::sync::Arc;

use serde_json::Value;

use ctxbridge_core::error::Result;
use ctxbridge_core::protocol::ClientId;

use crate::dispatch::registry::ServiceRegistry;

/// Per-call context passed to handlers (borrow tools instead of owning).
#[derive(Clone)]
pub struct CallContext {
    service: Arc<str>,
    client_id: ClientId,
    id: u64,
    registry: ServiceRegistry,
}

impl CallContext {
    pub(crate) fn new(service: Arc<str>, client_id: ClientId, id: u64, registry: ServiceRegistry) -> Self {
        Self {
            service,
            client_id,
            id,
            registry,
        }
    }

    pub fn service(&self) -> &str { &self.service }
    pub fn client_id(&self) -> &ClientId { &self.client_id }
    pub fn id(&self) -> u64 { self.id }

    /// Broadcast an event of this service, e.g. a `changed` after a `save`.
    pub fn broadcast(&self, event: &str, payload: Value, targets: Option<&[ClientId]>) -> Result<usize> {
        self.registry.broadcast(&self.service, event, payload, targets)
    }
}
