//! Scripted attribute values
//!
//! The attribute-function interpolator evaluates a script written in a safe
//! expression grammar. This is a deliberate restriction of arbitrary script
//! execution: the grammar has no loops, no I/O and no host access beyond the
//! documented bindings (`token`, `now`), the per-specification persistent
//! state, the run-wide `globals` store, and `entity(...)` remote lookups
//! resolved against the context broker.

pub mod eval;
pub mod lexer;
pub mod parser;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::ValueError;
use crate::script::eval::{Bindings, EntityEnv};
use crate::script::parser::Program;

/// Remote attribute lookup seam.
///
/// Implemented by the protocol emitter against the configured context broker;
/// tests use stub implementations.
#[async_trait]
pub trait AttributeLookup: Send + Sync {
    /// Current value of another entity's attribute
    async fn attribute_value(
        &self,
        entity_id: &str,
        entity_type: Option<&str>,
        attribute: &str,
    ) -> Result<Value, ValueError>;
}

/// Lookup used when no context broker is configured
pub struct NoLookup;

#[async_trait]
impl AttributeLookup for NoLookup {
    async fn attribute_value(
        &self,
        entity_id: &str,
        _entity_type: Option<&str>,
        attribute: &str,
    ) -> Result<Value, ValueError> {
        Err(ValueError::Lookup {
            entity_id: entity_id.to_string(),
            attribute: attribute.to_string(),
            reason: "no context broker is configured for remote lookups".to_string(),
        })
    }
}

/// Shared global state of one simulation run
pub type GlobalState = Mutex<HashMap<String, Value>>;

/// Parsed attribute-function interpolator
#[derive(Debug)]
pub enum FunctionInterpolator {
    /// The payload was a JSON literal, passed through on every resolution
    Literal(Value),
    /// The payload is a script with per-specification persistent state
    Script { program: Program, state: Mutex<HashMap<String, Value>> },
}

impl FunctionInterpolator {
    /// Parse a payload: JSON literals pass through, everything else must
    /// parse as a script.
    pub fn from_payload(spec: &str, payload: &str) -> Result<Self, ValueError> {
        if let Ok(literal) = serde_json::from_str::<Value>(payload) {
            return Ok(FunctionInterpolator::Literal(literal));
        }
        let program = Program::parse(payload)
            .map_err(|e| ValueError::invalid(spec, format!("invalid script: {e}")))?;
        Ok(FunctionInterpolator::Script { program, state: Mutex::new(HashMap::new()) })
    }

    /// Evaluate at the given instant.
    ///
    /// Remote references are resolved through `lookup` before evaluation;
    /// state emitted by the script is merged back (per-spec fields overwrite
    /// by name, global fields merge into the shared store).
    pub async fn resolve(
        &self,
        spec: &str,
        now: DateTime<Utc>,
        token: Option<&str>,
        globals: &GlobalState,
        lookup: &dyn AttributeLookup,
    ) -> Result<Value, ValueError> {
        let (program, state) = match self {
            FunctionInterpolator::Literal(value) => return Ok(value.clone()),
            FunctionInterpolator::Script { program, state } => (program, state),
        };

        let mut entities = EntityEnv::new();
        for reference in eval::entity_refs(program)? {
            let value = lookup
                .attribute_value(
                    &reference.entity_id,
                    reference.entity_type.as_deref(),
                    &reference.attribute,
                )
                .await?;
            entities.insert(reference, value);
        }

        let bindings = Bindings {
            token: token.map(str::to_string),
            now_epoch_seconds: now.timestamp_millis() as f64 / 1000.0,
        };
        let previous_state = state.lock().clone();
        let globals_snapshot = globals.lock().clone();

        let outcome = eval::evaluate(program, &bindings, &previous_state, &globals_snapshot, &entities)
            .map_err(|e| ValueError::resolution(spec, e.to_string()))?;

        *state.lock() = outcome.state;
        if !outcome.global_writes.is_empty() {
            let mut shared = globals.lock();
            for (field, value) in outcome.global_writes {
                shared.insert(field, value);
            }
        }
        Ok(outcome.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedLookup(Value);

    #[async_trait]
    impl AttributeLookup for FixedLookup {
        async fn attribute_value(
            &self,
            _entity_id: &str,
            _entity_type: Option<&str>,
            _attribute: &str,
        ) -> Result<Value, ValueError> {
            Ok(self.0.clone())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 10, 20, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_literal_payload_passthrough() {
        let interpolator = FunctionInterpolator::from_payload("s", "[1,2,3]").unwrap();
        let globals = GlobalState::default();
        let value =
            interpolator.resolve("s", now(), None, &globals, &NoLookup).await.unwrap();
        assert_eq!(value, serde_json::json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_script_state_survives_across_resolutions() {
        let interpolator =
            FunctionInterpolator::from_payload("s", "state n = 0; n = n + 1; n").unwrap();
        let globals = GlobalState::default();
        for expected in 1..=3 {
            let value =
                interpolator.resolve("s", now(), None, &globals, &NoLookup).await.unwrap();
            assert_eq!(value, Value::from(expected));
        }
    }

    #[tokio::test]
    async fn test_globals_shared_across_specifications() {
        let first =
            FunctionInterpolator::from_payload("a", "globals.hits = globals.hits + 1; globals.hits")
                .unwrap();
        let second = FunctionInterpolator::from_payload("b", "globals.hits").unwrap();
        let globals = GlobalState::default();
        globals.lock().insert("hits".to_string(), Value::from(0));

        first.resolve("a", now(), None, &globals, &NoLookup).await.unwrap();
        let seen = second.resolve("b", now(), None, &globals, &NoLookup).await.unwrap();
        assert_eq!(seen, Value::from(1));
    }

    #[tokio::test]
    async fn test_remote_lookup_feeds_script() {
        let interpolator =
            FunctionInterpolator::from_payload("s", "entity('E1', 'level') * 2").unwrap();
        let globals = GlobalState::default();
        let value = interpolator
            .resolve("s", now(), None, &globals, &FixedLookup(Value::from(21)))
            .await
            .unwrap();
        assert_eq!(value, Value::from(42));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_resolution_error() {
        let interpolator =
            FunctionInterpolator::from_payload("s", "entity('E1', 'level')").unwrap();
        let globals = GlobalState::default();
        let result = interpolator.resolve("s", now(), None, &globals, &NoLookup).await;
        assert!(result.is_err());
    }
}
