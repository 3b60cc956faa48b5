//! Wire payload construction
//!
//! Builders are pure: they take a resolved element (all attribute values
//! already computed) and produce the outbound update that a transport can
//! deliver.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::EmitterError;
use crate::{SYNTHETIC_ORIGINATOR, SYNTHETIC_SUBSCRIPTION_ID};

/// NGSI protocol version spoken by the context broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NgsiVersion {
    V1,
    V2,
}

impl NgsiVersion {
    /// Parse the configuration notation (`"1.0"` / `"2.0"`)
    pub fn parse(text: &str) -> Result<Self, EmitterError> {
        match text {
            "1.0" => Ok(NgsiVersion::V1),
            "2.0" => Ok(NgsiVersion::V2),
            other => Err(EmitterError::NgsiVersionNotSupported(other.to_string())),
        }
    }
}

/// Whether entity updates go to the broker itself or to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerDestination {
    ContextBroker,
    Subscriber,
}

/// Device payload protocol and transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceProtocol {
    UltraLightHttp,
    UltraLightMqtt,
    JsonHttp,
    JsonMqtt,
}

impl DeviceProtocol {
    /// Parse the configuration notation (`"UltraLight::HTTP"` etc.)
    pub fn parse(text: &str) -> Result<Self, EmitterError> {
        match text {
            "UltraLight::HTTP" => Ok(DeviceProtocol::UltraLightHttp),
            "UltraLight::MQTT" => Ok(DeviceProtocol::UltraLightMqtt),
            "JSON::HTTP" => Ok(DeviceProtocol::JsonHttp),
            "JSON::MQTT" => Ok(DeviceProtocol::JsonMqtt),
            other => Err(EmitterError::ProtocolNotSupported(other.to_string())),
        }
    }

    /// True for the MQTT transports
    pub fn is_mqtt(&self) -> bool {
        matches!(self, DeviceProtocol::UltraLightMqtt | DeviceProtocol::JsonMqtt)
    }
}

/// A resolved attribute metadata entry
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub meta_type: String,
    pub value: Value,
}

/// A resolved attribute ready for the wire
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub attr_type: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub metadata: Vec<ResolvedMetadata>,
}

/// An entity with all attribute values computed
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEntity {
    pub entity_name: String,
    pub entity_type: String,
    pub static_attributes: Vec<ResolvedAttribute>,
    pub active_attributes: Vec<ResolvedAttribute>,
}

impl ResolvedEntity {
    fn all_attributes(&self) -> impl Iterator<Item = &ResolvedAttribute> {
        self.static_attributes.iter().chain(self.active_attributes.iter())
    }
}

/// A device with all attribute values computed, keyed by object id
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedDevice {
    pub device_id: String,
    pub api_key: String,
    pub protocol: DeviceProtocol,
    pub values: Vec<(String, Value)>,
}

/// Where an update is delivered
#[derive(Debug, Clone, Serialize)]
pub enum UpdateTarget {
    Http {
        url: String,
        content_type: String,
        service: Option<String>,
        subservice: Option<String>,
        #[serde(skip_serializing)]
        token: Option<String>,
    },
    Mqtt {
        topic: String,
    },
}

/// The body of an outbound update
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UpdateBody {
    Json(Value),
    Text(String),
}

impl UpdateBody {
    /// The body as transported bytes
    pub fn to_wire(&self) -> Result<String, EmitterError> {
        match self {
            UpdateBody::Json(value) => Ok(serde_json::to_string(value)?),
            UpdateBody::Text(text) => Ok(text.clone()),
        }
    }
}

/// A fully built update, ready for delivery and for reporting on the event feed
#[derive(Debug, Clone, Serialize)]
pub struct OutboundUpdate {
    /// Element identity, for diagnostics (`entity_name` or `device_id`)
    pub element: String,
    pub target: UpdateTarget,
    pub body: UpdateBody,
}

/// The normalized outcome of one delivery
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn v1_attribute(attribute: &ResolvedAttribute) -> Value {
    let mut object = Map::new();
    object.insert("name".to_string(), Value::from(attribute.name.clone()));
    object.insert("type".to_string(), Value::from(attribute.attr_type.clone()));
    object.insert("value".to_string(), attribute.value.clone());
    if !attribute.metadata.is_empty() {
        let metadatas: Vec<Value> = attribute
            .metadata
            .iter()
            .map(|m| json!({ "name": m.name, "type": m.meta_type, "value": m.value }))
            .collect();
        object.insert("metadatas".to_string(), Value::Array(metadatas));
    }
    Value::Object(object)
}

fn v1_context_element(entity: &ResolvedEntity) -> Value {
    json!({
        "id": entity.entity_name,
        "type": entity.entity_type,
        "isPattern": "false",
        "attributes": entity.all_attributes().map(v1_attribute).collect::<Vec<_>>(),
    })
}

/// NGSI v1 `updateContext` body with `updateAction: APPEND`
pub fn ngsi_v1_update(entity: &ResolvedEntity) -> Value {
    json!({
        "contextElements": [v1_context_element(entity)],
        "updateAction": "APPEND",
    })
}

/// Synthetic NGSI v1 subscriber notification body
pub fn ngsi_v1_notification(entity: &ResolvedEntity) -> Value {
    json!({
        "subscriptionId": SYNTHETIC_SUBSCRIPTION_ID,
        "originator": SYNTHETIC_ORIGINATOR,
        "contextResponses": [{
            "contextElement": v1_context_element(entity),
            "statusCode": { "code": "200", "reasonPhrase": "OK" },
        }],
    })
}

/// NGSI v2 batch `op/update` body with `actionType: APPEND`
pub fn ngsi_v2_update(entity: &ResolvedEntity) -> Value {
    let mut object = Map::new();
    object.insert("id".to_string(), Value::from(entity.entity_name.clone()));
    object.insert("type".to_string(), Value::from(entity.entity_type.clone()));
    for attribute in entity.all_attributes() {
        let mut body = Map::new();
        body.insert("type".to_string(), Value::from(attribute.attr_type.clone()));
        body.insert("value".to_string(), attribute.value.clone());
        if !attribute.metadata.is_empty() {
            let mut metadata = Map::new();
            for m in &attribute.metadata {
                metadata.insert(
                    m.name.clone(),
                    json!({ "type": m.meta_type, "value": m.value }),
                );
            }
            body.insert("metadata".to_string(), Value::Object(metadata));
        }
        object.insert(attribute.name.clone(), Value::Object(body));
    }
    json!({ "actionType": "APPEND", "entities": [Value::Object(object)] })
}

/// UltraLight pipe-delimited device payload
pub fn ultralight_payload(device: &ResolvedDevice) -> String {
    device
        .values
        .iter()
        .map(|(object_id, value)| format!("{object_id}|{}", ultralight_value(value)))
        .collect::<Vec<_>>()
        .join("|")
}

fn ultralight_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Flat JSON device payload keyed by object id
pub fn json_device_payload(device: &ResolvedDevice) -> Value {
    let mut object = Map::new();
    for (object_id, value) in &device.values {
        object.insert(object_id.clone(), value.clone());
    }
    Value::Object(object)
}

/// MQTT topic for a device: `/<api_key>/<device_id>/attrs`
pub fn device_topic(device: &ResolvedDevice) -> String {
    format!("/{}/{}/attrs", device.api_key, device.device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> ResolvedEntity {
        ResolvedEntity {
            entity_name: "E1".to_string(),
            entity_type: "Room".to_string(),
            static_attributes: vec![ResolvedAttribute {
                name: "location".to_string(),
                attr_type: "geo:json".to_string(),
                value: json!({"type": "Point", "coordinates": [0.0, 0.0]}),
                metadata: vec![],
            }],
            active_attributes: vec![ResolvedAttribute {
                name: "temperature".to_string(),
                attr_type: "Number".to_string(),
                value: Value::from(0),
                metadata: vec![ResolvedMetadata {
                    name: "accuracy".to_string(),
                    meta_type: "Number".to_string(),
                    value: Value::from(0.5),
                }],
            }],
        }
    }

    fn device() -> ResolvedDevice {
        ResolvedDevice {
            device_id: "D1".to_string(),
            api_key: "key1".to_string(),
            protocol: DeviceProtocol::UltraLightHttp,
            values: vec![
                ("t".to_string(), Value::from(21.5)),
                ("s".to_string(), Value::from("on")),
            ],
        }
    }

    #[test]
    fn test_ngsi_v1_update_shape() {
        let body = ngsi_v1_update(&entity());
        assert_eq!(body["updateAction"], "APPEND");
        let element = &body["contextElements"][0];
        assert_eq!(element["id"], "E1");
        assert_eq!(element["isPattern"], "false");
        let attributes = element["attributes"].as_array().unwrap();
        assert_eq!(attributes.len(), 2);
        // Zero must survive as a real value, not be dropped as missing
        assert_eq!(attributes[1]["value"], Value::from(0));
        assert_eq!(attributes[1]["metadatas"][0]["name"], "accuracy");
    }

    #[test]
    fn test_ngsi_v1_notification_shape() {
        let body = ngsi_v1_notification(&entity());
        assert_eq!(body["subscriptionId"], SYNTHETIC_SUBSCRIPTION_ID);
        assert_eq!(body["originator"], SYNTHETIC_ORIGINATOR);
        assert_eq!(body["contextResponses"][0]["statusCode"]["code"], "200");
        assert_eq!(body["contextResponses"][0]["contextElement"]["id"], "E1");
    }

    #[test]
    fn test_ngsi_v2_update_shape() {
        let body = ngsi_v2_update(&entity());
        assert_eq!(body["actionType"], "APPEND");
        let first = &body["entities"][0];
        assert_eq!(first["id"], "E1");
        assert_eq!(first["temperature"]["value"], Value::from(0));
        assert_eq!(first["temperature"]["metadata"]["accuracy"]["value"], Value::from(0.5));
        assert_eq!(first["location"]["type"], "geo:json");
    }

    #[test]
    fn test_ultralight_payload() {
        assert_eq!(ultralight_payload(&device()), "t|21.5|s|on");
    }

    #[test]
    fn test_json_device_payload() {
        let body = json_device_payload(&device());
        assert_eq!(body["t"], Value::from(21.5));
        assert_eq!(body["s"], "on");
    }

    #[test]
    fn test_device_topic() {
        assert_eq!(device_topic(&device()), "/key1/D1/attrs");
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!(DeviceProtocol::parse("UltraLight::MQTT").unwrap(), DeviceProtocol::UltraLightMqtt);
        assert!(DeviceProtocol::parse("LoRaWAN").is_err());
        assert_eq!(NgsiVersion::parse("2.0").unwrap(), NgsiVersion::V2);
        assert!(NgsiVersion::parse("3.0").is_err());
    }
}
