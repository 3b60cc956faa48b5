//! Remote attribute lookup against the context broker
//!
//! Scripted attributes may reference another entity's current value. The
//! lookup is a plain query against the configured broker, in the NGSI
//! version the run speaks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::{json, Value};

use interpolation::{AttributeLookup, ValueError};

use crate::http::DEFAULT_TIMEOUT_SECS;
use crate::payload::NgsiVersion;

/// Context broker client implementing the interpolator lookup seam
pub struct BrokerLookup {
    client: Client,
    base_url: String,
    version: NgsiVersion,
    service: Option<String>,
    subservice: Option<String>,
    /// Shared with the token lifecycle manager
    token: Arc<RwLock<Option<String>>>,
}

impl BrokerLookup {
    /// Create a lookup client for one simulation run
    pub fn new(
        base_url: String,
        version: NgsiVersion,
        service: Option<String>,
        subservice: Option<String>,
        token: Arc<RwLock<Option<String>>>,
    ) -> Result<Self, ValueError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ValueError::Script(format!("lookup client: {e}")))?;
        Ok(Self { client, base_url, version, service, subservice, token })
    }

    fn lookup_error(entity_id: &str, attribute: &str, reason: impl Into<String>) -> ValueError {
        ValueError::Lookup {
            entity_id: entity_id.to_string(),
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }

    fn decorate(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut request = request;
        if let Some(service) = &self.service {
            request = request.header("Fiware-Service", service);
        }
        if let Some(subservice) = &self.subservice {
            request = request.header("Fiware-ServicePath", subservice);
        }
        if let Some(token) = self.token.read().clone() {
            request = request.header("X-Auth-Token", token);
        }
        request
    }

    async fn query_v2(
        &self,
        entity_id: &str,
        entity_type: Option<&str>,
        attribute: &str,
    ) -> Result<Value, ValueError> {
        let mut url =
            format!("{}/v2/entities/{entity_id}/attrs/{attribute}/value", self.base_url);
        if let Some(entity_type) = entity_type {
            url.push_str(&format!("?type={entity_type}"));
        }
        let response = self
            .decorate(self.client.get(&url))
            .send()
            .await
            .map_err(|e| Self::lookup_error(entity_id, attribute, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::lookup_error(entity_id, attribute, format!("status {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| Self::lookup_error(entity_id, attribute, e.to_string()))
    }

    async fn query_v1(
        &self,
        entity_id: &str,
        entity_type: Option<&str>,
        attribute: &str,
    ) -> Result<Value, ValueError> {
        let mut entity = json!({ "id": entity_id, "isPattern": "false" });
        if let Some(entity_type) = entity_type {
            entity["type"] = Value::from(entity_type);
        }
        let body = json!({ "entities": [entity], "attributes": [attribute] });
        let url = format!("{}/v1/queryContext", self.base_url);
        let response = self
            .decorate(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::lookup_error(entity_id, attribute, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::lookup_error(entity_id, attribute, format!("status {status}")));
        }
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| Self::lookup_error(entity_id, attribute, e.to_string()))?;
        parsed["contextResponses"][0]["contextElement"]["attributes"][0]
            .get("value")
            .cloned()
            .ok_or_else(|| {
                Self::lookup_error(entity_id, attribute, "attribute missing from query response")
            })
    }
}

#[async_trait]
impl AttributeLookup for BrokerLookup {
    async fn attribute_value(
        &self,
        entity_id: &str,
        entity_type: Option<&str>,
        attribute: &str,
    ) -> Result<Value, ValueError> {
        match self.version {
            NgsiVersion::V2 => self.query_v2(entity_id, entity_type, attribute).await,
            NgsiVersion::V1 => self.query_v1(entity_id, entity_type, attribute).await,
        }
    }
}
