//! Error types for attribute value resolution

use thiserror::Error;

/// Errors that can occur while resolving an attribute value
#[derive(Error, Debug)]
pub enum ValueError {
    #[error("Invalid interpolation specification '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("Resolution of '{spec}' failed: {reason}")]
    Resolution { spec: String, reason: String },

    #[error("Script error: {0}")]
    Script(String),

    #[error("Remote attribute lookup failed for entity '{entity_id}' attribute '{attribute}': {reason}")]
    Lookup { entity_id: String, attribute: String, reason: String },
}

impl ValueError {
    /// Build an invalid-spec error
    pub fn invalid(spec: &str, reason: impl Into<String>) -> Self {
        ValueError::InvalidSpec { spec: spec.to_string(), reason: reason.into() }
    }

    /// Build a resolution error
    pub fn resolution(spec: &str, reason: impl Into<String>) -> Self {
        ValueError::Resolution { spec: spec.to_string(), reason: reason.into() }
    }

    /// True when the failure happened at specification parse time
    pub fn is_invalid_spec(&self) -> bool {
        matches!(self, ValueError::InvalidSpec { .. })
    }
}
