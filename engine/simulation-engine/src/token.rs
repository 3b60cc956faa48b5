//! Authentication token lifecycle
//!
//! States: Unauthenticated -> Requesting -> Valid -> RefreshScheduled ->
//! Requesting, with a terminal Failed once retries are exhausted. Refreshes
//! run on the wall clock even in fast-forward runs; token expiry is a real
//! backend property, not a simulated one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::json;

use crate::config::{AuthenticationConfig, DomainConfig, RetryConfig, TokenProviderKind};
use crate::context::RunContext;
use crate::error::SimulationError;
use crate::events::SimulationEvent;

/// Seconds before expiry at which a refresh is scheduled
pub const REFRESH_MARGIN_SECS: i64 = 60;

/// Fixed lifetime of the opaque FIWARE Lab tokens, in seconds
pub const FIWARE_LAB_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Lifecycle states, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unauthenticated,
    Requesting,
    Valid,
    RefreshScheduled,
    Failed,
}

/// A granted token with its expiry
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Provider seam: one request/response exchange against the identity backend
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<TokenGrant, SimulationError>;
}

/// HTTP token fetcher covering both supported providers
pub struct HttpTokenFetcher {
    client: Client,
    config: AuthenticationConfig,
    domain: Option<DomainConfig>,
}

impl HttpTokenFetcher {
    pub fn new(
        config: AuthenticationConfig,
        domain: Option<DomainConfig>,
    ) -> Result<Self, SimulationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| SimulationError::Internal(format!("token client: {e}")))?;
        Ok(Self { client, config, domain })
    }

    /// Keystone: scoped password request; token in the `X-Subject-Token`
    /// header, expiry in the body.
    async fn fetch_keystone(&self) -> Result<TokenGrant, SimulationError> {
        let transport = |e: reqwest::Error| SimulationError::Transport(e.to_string());
        let url = format!("{}/v3/auth/tokens", self.config.base_url());
        let mut body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.user,
                            "password": self.config.password,
                        }
                    }
                }
            }
        });
        if let Some(domain) = &self.domain {
            body["auth"]["identity"]["password"]["user"]["domain"] =
                json!({ "name": domain.service });
            body["auth"]["scope"] = json!({
                "project": { "domain": { "name": domain.service }, "name": domain.subservice }
            });
        }

        let response = self.client.post(&url).json(&body).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SimulationError::Transport(format!("token request status {status}")));
        }
        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                SimulationError::Transport("token response without X-Subject-Token".to_string())
            })?;
        let parsed: serde_json::Value = response.json().await.map_err(transport)?;
        let expires_at = parsed["token"]["expires_at"]
            .as_str()
            .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
            .map(|at| at.with_timezone(&Utc))
            .ok_or_else(|| {
                SimulationError::Transport("token response without expires_at".to_string())
            })?;
        Ok(TokenGrant { token, expires_at })
    }

    /// FIWARE Lab: opaque token in the response body with a fixed lifetime
    async fn fetch_fiware_lab(&self) -> Result<TokenGrant, SimulationError> {
        let transport = |e: reqwest::Error| SimulationError::Transport(e.to_string());
        let url = format!("{}/token", self.config.base_url());
        let body = json!({
            "username": self.config.user,
            "password": self.config.password,
        });
        let response = self.client.post(&url).json(&body).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SimulationError::Transport(format!("token request status {status}")));
        }
        let token = response.text().await.map_err(transport)?.trim().to_string();
        if token.is_empty() {
            return Err(SimulationError::Transport("empty token response".to_string()));
        }
        Ok(TokenGrant {
            token,
            expires_at: Utc::now() + chrono::Duration::seconds(FIWARE_LAB_TOKEN_LIFETIME_SECS),
        })
    }
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch(&self) -> Result<TokenGrant, SimulationError> {
        match self.config.provider {
            TokenProviderKind::Keystone => self.fetch_keystone().await,
            TokenProviderKind::FiwareLab => self.fetch_fiware_lab().await,
        }
    }
}

/// Drives obtain and refresh against a fetcher, with bounded retry
pub struct TokenManager {
    fetcher: Arc<dyn TokenFetcher>,
    retry: Option<RetryConfig>,
    state: parking_lot::RwLock<TokenState>,
}

impl TokenManager {
    pub fn new(fetcher: Arc<dyn TokenFetcher>, retry: Option<RetryConfig>) -> Self {
        Self { fetcher, retry, state: parking_lot::RwLock::new(TokenState::Unauthenticated) }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TokenState {
        *self.state.read()
    }

    /// Obtain a token, retrying per the configured policy.
    ///
    /// Emits one `token-request` per attempt and `token-response` on success.
    /// Exhausting retries yields `TokenNotAvailable`.
    pub async fn obtain(&self, ctx: &RunContext) -> Result<TokenGrant, SimulationError> {
        let attempts = self.retry.as_ref().map(|retry| retry.times).unwrap_or(0) + 1;
        let interval =
            Duration::from_millis(self.retry.as_ref().map(|retry| retry.interval_ms).unwrap_or(0));

        let mut last_reason = String::new();
        for attempt in 1..=attempts {
            *self.state.write() = TokenState::Requesting;
            ctx.emit(SimulationEvent::TokenRequest);
            tracing::debug!(attempt, attempts, "requesting token");
            match self.fetcher.fetch().await {
                Ok(grant) => {
                    *self.state.write() = TokenState::Valid;
                    *ctx.token.write() = Some(grant.token.clone());
                    ctx.emit(SimulationEvent::TokenResponse { expires_at: grant.expires_at });
                    tracing::info!(expires_at = %grant.expires_at, "token obtained");
                    return Ok(grant);
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, "token request failed: {e}");
                    last_reason = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
        *self.state.write() = TokenState::Failed;
        Err(SimulationError::TokenNotAvailable { attempts, reason: last_reason })
    }

    /// The instant at which a grant's refresh is due
    pub fn refresh_at(grant: &TokenGrant) -> DateTime<Utc> {
        grant.expires_at - chrono::Duration::seconds(REFRESH_MARGIN_SECS)
    }

    /// Refresh loop: re-request ahead of each expiry until the run stops.
    ///
    /// The caller announces the first refresh (`token-request-scheduled`);
    /// every renewal here announces the next one. A refresh failure after
    /// retries is fatal and asks the run to end.
    pub async fn run_refresh_loop(&self, ctx: Arc<RunContext>, mut grant: TokenGrant) {
        loop {
            *self.state.write() = TokenState::RefreshScheduled;
            let wait = (Self::refresh_at(&grant) - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = ctx.stopped() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if ctx.is_stopping() {
                return;
            }
            match self.obtain(&ctx).await {
                Ok(renewed) => {
                    ctx.emit(SimulationEvent::TokenRequestScheduled {
                        scheduled_at: Self::refresh_at(&renewed),
                    });
                    grant = renewed;
                }
                Err(e) => {
                    tracing::error!("token refresh failed: {e}");
                    ctx.emit(SimulationEvent::Error { error: e.to_string(), request: None });
                    ctx.request_stop();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::context::{RunOptions, RunContext};
    use crate::events::EventFeed;
    use interpolation::{script::NoLookup, Resolver};
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then succeeds
    struct FlakyFetcher {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenFetcher for FlakyFetcher {
        async fn fetch(&self) -> Result<TokenGrant, SimulationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(SimulationError::Transport("connection refused".to_string()))
            } else {
                Ok(TokenGrant {
                    token: "tok".to_string(),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                })
            }
        }
    }

    fn context() -> RunContext {
        RunContext::new(
            RunOptions::default(),
            SimClock::real(),
            EventFeed::new(),
            Arc::new(RwLock::new(None)),
            Resolver::new(Arc::new(NoLookup)),
            Arc::new(crate::dispatch::tests::NullGateway),
            None,
            None,
            None,
        )
    }

    fn count_events(
        receiver: &mut tokio::sync::broadcast::Receiver<SimulationEvent>,
        name: &str,
    ) -> usize {
        let mut count = 0;
        while let Ok(event) = receiver.try_recv() {
            if event.name() == name {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_retry_until_success_emits_one_request_per_attempt() {
        let ctx = context();
        let mut receiver = ctx.feed.subscribe();
        let manager = TokenManager::new(
            Arc::new(FlakyFetcher { failures: 2, calls: AtomicU32::new(0) }),
            Some(RetryConfig { times: 3, interval_ms: 1 }),
        );
        let grant = manager.obtain(&ctx).await.unwrap();
        assert_eq!(grant.token, "tok");
        assert_eq!(ctx.token.read().as_deref(), Some("tok"));

        let mut requests = 0;
        let mut responses = 0;
        while let Ok(event) = receiver.try_recv() {
            match event.name() {
                "token-request" => requests += 1,
                "token-response" => responses += 1,
                _ => {}
            }
        }
        assert_eq!(requests, 3);
        assert_eq!(responses, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_is_token_not_available() {
        let ctx = context();
        let mut receiver = ctx.feed.subscribe();
        let manager = TokenManager::new(
            Arc::new(FlakyFetcher { failures: 10, calls: AtomicU32::new(0) }),
            Some(RetryConfig { times: 1, interval_ms: 1 }),
        );
        let error = manager.obtain(&ctx).await.unwrap_err();
        assert!(matches!(error, SimulationError::TokenNotAvailable { attempts: 2, .. }));
        assert_eq!(count_events(&mut receiver, "token-request"), 2);
        assert!(ctx.token.read().is_none());
    }

    #[tokio::test]
    async fn test_no_retry_config_means_single_attempt() {
        let ctx = context();
        let manager = TokenManager::new(
            Arc::new(FlakyFetcher { failures: 1, calls: AtomicU32::new(0) }),
            None,
        );
        assert!(manager.obtain(&ctx).await.is_err());
    }
}
