//! Error taxonomy for simulation runs

use thiserror::Error;

use interpolation::ValueError;
use protocol_emitter::EmitterError;

/// Errors that can occur during a simulation run.
///
/// Fatal kinds abort the run (one `end` event); recovered kinds are reported
/// as `error` events while the run continues.
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Simulation configuration not valid: {0}")]
    ConfigurationNotValid(String),

    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(String),

    #[error("NGSI version not supported: {0}")]
    NgsiVersionNotSupported(String),

    #[error("Token not available after {attempts} attempts: {reason}")]
    TokenNotAvailable { attempts: u32, reason: String },

    #[error("Package not imported: {0}")]
    PackageNotImported(String),

    #[error("Invalid interpolation specification: {0}")]
    InvalidInterpolationSpec(String),

    #[error("Value resolution failed: {0}")]
    ValueResolution(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SimulationError {
    /// True when the error ends the run rather than being reported and
    /// recovered from
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SimulationError::ValueResolution(_) | SimulationError::Transport(_)
        )
    }
}

impl From<EmitterError> for SimulationError {
    fn from(error: EmitterError) -> Self {
        match error {
            EmitterError::ProtocolNotSupported(p) => SimulationError::ProtocolNotSupported(p),
            EmitterError::NgsiVersionNotSupported(v) => SimulationError::NgsiVersionNotSupported(v),
            other => SimulationError::Transport(other.to_string()),
        }
    }
}

impl From<ValueError> for SimulationError {
    fn from(error: ValueError) -> Self {
        if error.is_invalid_spec() {
            SimulationError::InvalidInterpolationSpec(error.to_string())
        } else {
            SimulationError::ValueResolution(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SimulationError::ConfigurationNotValid("x".to_string()).is_fatal());
        assert!(SimulationError::TokenNotAvailable { attempts: 3, reason: "x".to_string() }
            .is_fatal());
        assert!(!SimulationError::ValueResolution("x".to_string()).is_fatal());
        assert!(!SimulationError::Transport("x".to_string()).is_fatal());
    }

    #[test]
    fn test_emitter_error_mapping() {
        let error: SimulationError = EmitterError::ProtocolNotSupported("LoRa".to_string()).into();
        assert!(matches!(error, SimulationError::ProtocolNotSupported(_)));
        let error: SimulationError = EmitterError::Mqtt("refused".to_string()).into();
        assert!(matches!(error, SimulationError::Transport(_)));
    }
}
