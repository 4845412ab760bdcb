use std::collections::HashSet;

use serde::Deserialize;

use ctxbridge_core::error::{BridgeError, Result};
use ctxbridge_core::protocol::WireFormat;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub version: u32,

    #[serde(default)]
    pub transport: TransportSection,

    #[serde(default)]
    pub runtime: RuntimeSection,

    #[serde(default)]
    pub client: ClientSection,

    #[serde(default)]
    pub services: Vec<ServiceLimits>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: 1,
            transport: TransportSection::default(),
            runtime: RuntimeSection::default(),
            client: ClientSection::default(),
            services: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(BridgeError::UnsupportedVersion);
        }
        self.runtime.validate()?;
        self.client.validate()?;

        let mut seen = HashSet::new();
        for s in &self.services {
            if !seen.insert(s.name.as_str()) {
                return Err(BridgeError::Config(format!(
                    "services: duplicate entry for {}",
                    s.name
                )));
            }
            s.validate()?;
        }
        Ok(())
    }

    /// Client capacity for a service (per-service override or runtime default).
    pub fn max_clients_for(&self, service: &str) -> usize {
        self.services
            .iter()
            .find(|s| s.name == service)
            .map(|s| s.max_clients)
            .unwrap_or(self.runtime.default_max_clients)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportSection {
    #[serde(default)]
    pub wire_format: WireFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    #[serde(default = "default_max_clients")]
    pub default_max_clients: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            default_max_clients: default_max_clients(),
        }
    }
}

impl RuntimeSection {
    pub fn validate(&self) -> Result<()> {
        if self.default_max_clients == 0 {
            return Err(BridgeError::Config(
                "runtime.default_max_clients must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ClientSection {
    pub fn validate(&self) -> Result<()> {
        if !(100..=60000).contains(&self.connect_timeout_ms) {
            return Err(BridgeError::Config(
                "client.connect_timeout_ms must be between 100 and 60000".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceLimits {
    pub name: String,
    pub max_clients: usize,
}

impl ServiceLimits {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BridgeError::Config("services[].name must not be empty".into()));
        }
        if self.max_clients == 0 {
            return Err(BridgeError::Config(format!(
                "services[{}].max_clients must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_max_clients() -> usize {
    1024
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
