//! Update routing: payload construction plus transport selection

use async_trait::async_trait;

use crate::error::EmitterError;
use crate::http::HttpTransport;
use crate::mqtt::{MqttEndpoint, MqttTransport};
use crate::payload::{
    self, BrokerDestination, DeliveryReport, DeviceProtocol, NgsiVersion, OutboundUpdate,
    ResolvedDevice, ResolvedEntity, UpdateBody, UpdateTarget,
};

/// Delivery seam between the dispatch controller and the transports.
///
/// The engine builds updates and hands them to a gateway; tests substitute a
/// recording stub for the real transports.
#[async_trait]
pub trait UpdateGateway: Send + Sync {
    /// Deliver one update and normalize the outcome
    async fn deliver(&self, update: &OutboundUpdate) -> Result<DeliveryReport, EmitterError>;
}

/// Route for entity updates: the broker or subscriber endpoint
#[derive(Debug, Clone)]
pub struct EntityRoute {
    /// `protocol://host:port`
    pub base_url: String,
    pub version: NgsiVersion,
    pub destination: BrokerDestination,
    /// Subscriber notification path, defaults to `/notify`
    pub path: Option<String>,
    pub service: Option<String>,
    pub subservice: Option<String>,
}

/// Route for device updates delivered over HTTP
#[derive(Debug, Clone)]
pub struct DeviceRoute {
    /// `protocol://host:port` of the IoT agent's HTTP endpoint
    pub http_base_url: Option<String>,
    pub service: Option<String>,
    pub subservice: Option<String>,
}

/// Build the outbound update for an entity
pub fn build_entity_update(
    route: &EntityRoute,
    entity: &ResolvedEntity,
    token: Option<&str>,
) -> Result<OutboundUpdate, EmitterError> {
    let (url, body) = match (route.destination, route.version) {
        (BrokerDestination::ContextBroker, NgsiVersion::V1) => (
            format!("{}/v1/updateContext", route.base_url),
            payload::ngsi_v1_update(entity),
        ),
        (BrokerDestination::ContextBroker, NgsiVersion::V2) => (
            format!("{}/v2/op/update", route.base_url),
            payload::ngsi_v2_update(entity),
        ),
        (BrokerDestination::Subscriber, NgsiVersion::V1) => {
            let path = route.path.as_deref().unwrap_or("/notify");
            (format!("{}{path}", route.base_url), payload::ngsi_v1_notification(entity))
        }
        (BrokerDestination::Subscriber, NgsiVersion::V2) => {
            // Subscriber notifications only exist in the v1 shape
            return Err(EmitterError::NgsiVersionNotSupported(
                "2.0 subscriber notifications".to_string(),
            ));
        }
    };
    Ok(OutboundUpdate {
        element: entity.entity_name.clone(),
        target: UpdateTarget::Http {
            url,
            content_type: "application/json".to_string(),
            service: route.service.clone(),
            subservice: route.subservice.clone(),
            token: token.map(str::to_string),
        },
        body: UpdateBody::Json(body),
    })
}

/// Build the outbound update for a device
pub fn build_device_update(
    route: &DeviceRoute,
    device: &ResolvedDevice,
    token: Option<&str>,
) -> Result<OutboundUpdate, EmitterError> {
    if device.protocol.is_mqtt() {
        let body = match device.protocol {
            DeviceProtocol::UltraLightMqtt => UpdateBody::Text(payload::ultralight_payload(device)),
            DeviceProtocol::JsonMqtt => UpdateBody::Json(payload::json_device_payload(device)),
            _ => unreachable!("is_mqtt covers exactly the mqtt protocols"),
        };
        return Ok(OutboundUpdate {
            element: device.device_id.clone(),
            target: UpdateTarget::Mqtt { topic: payload::device_topic(device) },
            body,
        });
    }

    let base = route
        .http_base_url
        .as_deref()
        .ok_or_else(|| EmitterError::NoTransport(format!("HTTP agent for {}", device.device_id)))?;
    let (path, content_type, body) = match device.protocol {
        DeviceProtocol::UltraLightHttp => {
            ("/iot/d", "text/plain", UpdateBody::Text(payload::ultralight_payload(device)))
        }
        DeviceProtocol::JsonHttp => (
            "/iot/json",
            "application/json",
            UpdateBody::Json(payload::json_device_payload(device)),
        ),
        _ => unreachable!("mqtt handled above"),
    };
    Ok(OutboundUpdate {
        element: device.device_id.clone(),
        target: UpdateTarget::Http {
            url: format!("{base}{path}?k={}&i={}", device.api_key, device.device_id),
            content_type: content_type.to_string(),
            service: route.service.clone(),
            subservice: route.subservice.clone(),
            token: token.map(str::to_string),
        },
        body,
    })
}

/// The real gateway: HTTP plus a lazily connected MQTT client
pub struct Emitter {
    http: HttpTransport,
    mqtt: Option<MqttTransport>,
}

impl Emitter {
    /// Create the gateway; `mqtt` is only needed when MQTT devices exist
    pub fn new(mqtt: Option<MqttEndpoint>) -> Result<Self, EmitterError> {
        Ok(Self { http: HttpTransport::new()?, mqtt: mqtt.map(MqttTransport::new) })
    }
}

#[async_trait]
impl UpdateGateway for Emitter {
    async fn deliver(&self, update: &OutboundUpdate) -> Result<DeliveryReport, EmitterError> {
        match &update.target {
            UpdateTarget::Http { url, content_type, service, subservice, token } => {
                self.http
                    .post(
                        url,
                        content_type,
                        service.as_deref(),
                        subservice.as_deref(),
                        token.as_deref(),
                        update.body.to_wire()?,
                    )
                    .await
            }
            UpdateTarget::Mqtt { topic } => {
                let mqtt = self
                    .mqtt
                    .as_ref()
                    .ok_or_else(|| EmitterError::NoTransport("MQTT broker".to_string()))?;
                mqtt.publish(topic, update.body.to_wire()?).await
            }
        }
    }
}
