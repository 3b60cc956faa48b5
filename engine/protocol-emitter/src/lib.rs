//! # ProtocolEmitter
//!
//! Builds wire payloads for simulated entities and devices and performs the
//! transport call. Entities go to a context broker (NGSI v1 `updateContext`,
//! NGSI v2 batch `op/update`) or to an NGSI v1 subscriber as a synthetic
//! notification; devices go to an IoT agent as UltraLight pipe-delimited text
//! or flat JSON objects, over HTTP or MQTT.

pub mod emitter;
pub mod error;
pub mod http;
pub mod lookup;
pub mod mqtt;
pub mod payload;

pub use emitter::{
    build_device_update, build_entity_update, DeviceRoute, Emitter, EntityRoute, UpdateGateway,
};
pub use error::EmitterError;
pub use lookup::BrokerLookup;
pub use mqtt::MqttEndpoint;
pub use payload::{
    BrokerDestination, DeliveryReport, DeviceProtocol, NgsiVersion, OutboundUpdate,
    ResolvedAttribute, ResolvedDevice, ResolvedEntity, ResolvedMetadata, UpdateBody, UpdateTarget,
};

/// Current version of the protocol-emitter crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subscription id used in synthetic NGSI v1 notifications
pub const SYNTHETIC_SUBSCRIPTION_ID: &str = "0123456789012345678901234";

/// Originator used in synthetic NGSI v1 notifications
pub const SYNTHETIC_ORIGINATOR: &str = "localhost";
