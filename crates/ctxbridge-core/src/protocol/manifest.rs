//! Published service contract.
//!
//! A manifest is an ordered list of method/stream/event descriptors built when
//! the service is defined. The service sends it in the `connect-ack` payload so
//! a client proxy knows what it can call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// One entry of a service contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum Descriptor {
    Method(String),
    Stream(String),
    Event(String),
}

impl Descriptor {
    pub fn name(&self) -> &str {
        match self {
            Descriptor::Method(n) | Descriptor::Stream(n) | Descriptor::Event(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceManifest {
    pub service: String,
    pub entries: Vec<Descriptor>,
}

impl ServiceManifest {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entries: Vec::new(),
        }
    }

    /// Append a descriptor; a name may appear once per descriptor type.
    pub fn push(&mut self, d: Descriptor) -> bool {
        if self.entries.contains(&d) {
            return false;
        }
        self.entries.push(d);
        true
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|d| matches!(d, Descriptor::Method(n) if n == name))
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|d| matches!(d, Descriptor::Stream(n) if n == name))
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|d| matches!(d, Descriptor::Event(n) if n == name))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(v: Value) -> Result<Self> {
        serde_json::from_value(v).map_err(|e| BridgeError::Decode(format!("invalid manifest: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_wire_shape() {
        let mut m = ServiceManifest::new("contacts-service");
        m.push(Descriptor::Method("save".into()));
        m.push(Descriptor::Stream("getAll".into()));
        m.push(Descriptor::Event("changed".into()));
        assert_eq!(
            m.to_value(),
            json!({
                "service": "contacts-service",
                "entries": [
                    {"type": "method", "name": "save"},
                    {"type": "stream", "name": "getAll"},
                    {"type": "event", "name": "changed"}
                ]
            })
        );
    }

    #[test]
    fn lookups_respect_descriptor_type() {
        let mut m = ServiceManifest::new("svc");
        m.push(Descriptor::Stream("getAll".into()));
        assert!(m.has_stream("getAll"));
        assert!(!m.has_method("getAll"));
        assert!(!m.push(Descriptor::Stream("getAll".into())));
    }
}
