//! HTTP transport for outbound updates

use reqwest::Client;
use std::time::Duration;

use crate::error::EmitterError;
use crate::payload::DeliveryReport;

/// Default request timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Shared HTTP client for one simulation run.
///
/// Self-signed certificates are accepted: simulated backends routinely run
/// with ad-hoc TLS setups.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create the shared client
    pub fn new() -> Result<Self, EmitterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }

    /// POST a body and normalize the outcome
    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        service: Option<&str>,
        subservice: Option<&str>,
        token: Option<&str>,
        body: String,
    ) -> Result<DeliveryReport, EmitterError> {
        let mut request = self.client.post(url).header("Content-Type", content_type);
        if let Some(service) = service {
            request = request.header("Fiware-Service", service);
        }
        if let Some(subservice) = subservice {
            request = request.header("Fiware-ServicePath", subservice);
        }
        if let Some(token) = token {
            request = request.header("X-Auth-Token", token);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(EmitterError::UnexpectedStatus { status: status.as_u16(), body });
        }
        tracing::debug!(url, status = status.as_u16(), "update delivered");
        Ok(DeliveryReport {
            status: Some(status.as_u16()),
            body: if body.is_empty() { None } else { Some(body) },
        })
    }
}
