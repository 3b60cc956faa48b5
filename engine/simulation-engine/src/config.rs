//! Simulation configuration data model
//!
//! The engine consumes a configuration that already went through the external
//! validation and transpilation collaborators. Count templates are expanded
//! exactly once, before scheduling, and the expansion is immutable for the
//! rest of the run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use protocol_emitter::MqttEndpoint;

use crate::error::SimulationError;
use crate::schedule::ScheduleSpec;

/// Service and subservice of the simulated tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub service: String,
    pub subservice: String,
}

/// Context broker endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBrokerConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "ngsiVersion")]
    pub ngsi_version: String,
}

impl ContextBrokerConfig {
    /// `protocol://host:port`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// NGSI v1 subscriber endpoint receiving synthetic notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "ngsiVersion", default = "default_ngsi_version")]
    pub ngsi_version: String,
}

fn default_ngsi_version() -> String {
    "1.0".to_string()
}

impl SubscriberConfig {
    /// `protocol://host:port`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// HTTP endpoint of an IoT agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEndpoint {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl HttpEndpoint {
    /// `protocol://host:port`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Endpoints of one IoT agent payload flavor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpoints {
    #[serde(default)]
    pub http: Option<HttpEndpoint>,
    #[serde(default)]
    pub mqtt: Option<MqttEndpoint>,
}

/// IoT agent configuration, per payload flavor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IotAgentConfig {
    #[serde(default)]
    pub ultralight: Option<AgentEndpoints>,
    #[serde(default)]
    pub json: Option<AgentEndpoints>,
}

/// Token retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub times: u32,
    /// Milliseconds between attempts
    #[serde(rename = "interval")]
    pub interval_ms: u64,
}

/// Authentication provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenProviderKind {
    /// Structured body with an expiry, token in a response header
    #[serde(rename = "keystone")]
    Keystone,
    /// Opaque short-lived token with a fixed lifetime
    #[serde(rename = "fiware-lab")]
    FiwareLab,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    pub provider: TokenProviderKind,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl AuthenticationConfig {
    /// `protocol://host:port`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Attribute metadata entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub meta_type: String,
    pub value: Value,
}

/// An attribute of an entity (`name`) or device (`object_id`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(rename = "type", default)]
    pub attr_type: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<MetadataConfig>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
}

impl AttributeConfig {
    /// Diagnostic identifier: the name or object id
    pub fn identifier(&self) -> &str {
        self.name.as_deref().or(self.object_id.as_deref()).unwrap_or("<unnamed>")
    }
}

/// An entity or a count template of entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub entity_name: Option<String>,
    pub entity_type: String,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default, rename = "staticAttributes", skip_serializing_if = "Vec::is_empty")]
    pub static_attributes: Vec<AttributeConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active: Vec<AttributeConfig>,
}

/// A device or a count template of devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub device_id: Option<String>,
    pub protocol: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AttributeConfig>,
}

/// The full simulation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub domain: Option<DomainConfig>,
    #[serde(default, rename = "contextBroker")]
    pub context_broker: Option<ContextBrokerConfig>,
    #[serde(default)]
    pub subscriber: Option<SubscriberConfig>,
    #[serde(default, rename = "iotAgent")]
    pub iot_agent: Option<IotAgentConfig>,
    #[serde(default)]
    pub authentication: Option<AuthenticationConfig>,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl SimulationConfig {
    /// Expand count templates into concrete elements.
    ///
    /// Generated identities follow `type:index` (entities) and `id:index`
    /// (devices), 1-based. Expansion happens once; the result is owned by the
    /// run and never mutated afterwards.
    pub fn expanded(&self) -> Result<SimulationConfig, SimulationError> {
        let mut expanded = self.clone();
        expanded.entities = Vec::new();
        expanded.devices = Vec::new();

        for entity in &self.entities {
            match entity.count {
                None => expanded.entities.push(entity.clone()),
                Some(count) => {
                    for index in 1..=count {
                        let mut concrete = entity.clone();
                        concrete.count = None;
                        concrete.entity_name =
                            Some(format!("{}:{}", entity.entity_type, index));
                        expanded.entities.push(concrete);
                    }
                }
            }
        }
        for entity in &expanded.entities {
            if entity.entity_name.is_none() {
                return Err(SimulationError::ConfigurationNotValid(format!(
                    "entity of type '{}' has neither entity_name nor count",
                    entity.entity_type
                )));
            }
        }

        for device in &self.devices {
            match device.count {
                None => expanded.devices.push(device.clone()),
                Some(count) => {
                    let base = device.device_id.as_deref().unwrap_or("device");
                    for index in 1..=count {
                        let mut concrete = device.clone();
                        concrete.count = None;
                        concrete.device_id = Some(format!("{base}:{index}"));
                        expanded.devices.push(concrete);
                    }
                }
            }
        }
        for device in &expanded.devices {
            if device.device_id.is_none() {
                return Err(SimulationError::ConfigurationNotValid(
                    "device has neither device_id nor count".to_string(),
                ));
            }
        }

        Ok(expanded)
    }
}

/// External validation collaborator seam.
///
/// Validation itself (required fields, enumerations, interpolator syntax) is
/// outside the engine; the controller runs whatever implementation it is
/// given before wiring a run.
pub trait ConfigValidator: Send + Sync {
    fn validate(&self, config: SimulationConfig) -> Result<SimulationConfig, SimulationError>;
}

/// External transpilation collaborator seam (`import(...)` resolution and
/// conditional template substitution).
pub trait ConfigTranspiler: Send + Sync {
    fn transpile(&self, config: SimulationConfig) -> Result<SimulationConfig, SimulationError>;
}

/// Pass-through collaborator used when no external implementation is wired
pub struct AcceptAll;

impl ConfigValidator for AcceptAll {
    fn validate(&self, config: SimulationConfig) -> Result<SimulationConfig, SimulationError> {
        Ok(config)
    }
}

impl ConfigTranspiler for AcceptAll {
    fn transpile(&self, config: SimulationConfig) -> Result<SimulationConfig, SimulationError> {
        Ok(config)
    }
}
