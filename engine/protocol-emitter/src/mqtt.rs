//! Shared MQTT client for device payloads
//!
//! One client per simulation run, lazily connected the first time an MQTT
//! device fires. The connection lock doubles as the guard against duplicate
//! concurrent connect attempts. Publish failures surface as errors without
//! tearing down the connection.

use std::time::Duration;

use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::EmitterError;
use crate::payload::DeliveryReport;

/// MQTT broker endpoint of the IoT agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Lazily connected shared MQTT transport
pub struct MqttTransport {
    endpoint: MqttEndpoint,
    client: Mutex<Option<AsyncClient>>,
}

impl MqttTransport {
    /// Create an unconnected transport
    pub fn new(endpoint: MqttEndpoint) -> Self {
        Self { endpoint, client: Mutex::new(None) }
    }

    /// Publish a payload, connecting on first use
    pub async fn publish(&self, topic: &str, payload: String) -> Result<DeliveryReport, EmitterError> {
        let mut slot = self.client.lock().await;
        if slot.is_none() {
            *slot = Some(self.connect());
        }
        let client = slot.as_ref().expect("client just connected");

        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| EmitterError::Mqtt(e.to_string()))?;
        tracing::debug!(topic, "mqtt payload published");
        Ok(DeliveryReport { status: None, body: None })
    }

    fn connect(&self) -> AsyncClient {
        let client_id = format!("telemetry-sim-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let (Some(user), Some(password)) = (&self.endpoint.user, &self.endpoint.password) {
            options.set_credentials(user, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(rumqttc::ConnectionError::RequestsDone) => break,
                    Err(e) => {
                        tracing::warn!("mqtt eventloop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        tracing::info!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            "mqtt client connected"
        );
        client
    }
}
