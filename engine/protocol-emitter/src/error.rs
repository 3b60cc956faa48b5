//! Error types for payload construction and transport

use thiserror::Error;

/// Errors that can occur while building or delivering an update
#[derive(Error, Debug)]
pub enum EmitterError {
    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(String),

    #[error("NGSI version not supported: {0}")]
    NgsiVersionNotSupported(String),

    #[error("Unexpected response status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MQTT transport error: {0}")]
    Mqtt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No transport configured for {0}")]
    NoTransport(String),
}

impl EmitterError {
    /// True when the failure is fatal for the run rather than a recoverable
    /// delivery error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EmitterError::ProtocolNotSupported(_) | EmitterError::NgsiVersionNotSupported(_)
        )
    }
}
