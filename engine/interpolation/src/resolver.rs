//! Attribute value resolution with per-specification instance caching
//!
//! The resolver owns a registry mapping each exact specification string to
//! one interpolator instance, constructed lazily on first resolution. The
//! registry is what preserves continuity for stateful kinds (script state,
//! rotation reference instants) across repeated resolutions. A resolver is
//! owned by exactly one simulation run and rebuilt at every start.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::date_increment::DateIncrement;
use crate::error::ValueError;
use crate::multiline::Multiline;
use crate::script::{AttributeLookup, FunctionInterpolator, GlobalState};
use crate::spec::{parse_spec, InterpolatorKind, ParsedSpec};
use crate::text_rotation::TextRotation;
use crate::timeseries::{decimal_hour, RandomSeries, StepMode, TimeSeries};

/// Per-resolution inputs
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    /// Simulation clock (real or virtual)
    pub now: DateTime<Utc>,
    /// Current authentication token, exposed to scripted attributes
    pub token: Option<String>,
}

enum Instance {
    Linear(TimeSeries),
    StepBefore(TimeSeries),
    StepAfter(TimeSeries),
    RandomLinear(RandomSeries),
    DateIncrement(DateIncrement),
    MultilinePosition(Multiline),
    MultilineBearing(Multiline),
    TextRotation { rotation: TextRotation, reference: Mutex<Option<DateTime<Utc>>> },
    Function(FunctionInterpolator),
}

/// The Value Resolver
pub struct Resolver {
    lookup: Arc<dyn AttributeLookup>,
    instances: Mutex<HashMap<String, Arc<Instance>>>,
    globals: GlobalState,
}

impl Resolver {
    /// Create a resolver for one simulation run
    pub fn new(lookup: Arc<dyn AttributeLookup>) -> Self {
        Self { lookup, instances: Mutex::new(HashMap::new()), globals: GlobalState::default() }
    }

    /// Resolve an attribute value at the given instant.
    ///
    /// Non-string values and strings without a recognized interpolator prefix
    /// pass through unchanged.
    pub async fn resolve(
        &self,
        raw: &Value,
        context: &ResolutionContext,
    ) -> Result<Value, ValueError> {
        let Some(text) = raw.as_str() else {
            return Ok(raw.clone());
        };
        let parsed = match parse_spec(text) {
            None => return Ok(raw.clone()),
            Some(parsed) => parsed?,
        };
        let instance = self.instance(text, &parsed)?;
        self.apply(text, &instance, context).await
    }

    /// Number of cached interpolator instances
    pub fn cached_instances(&self) -> usize {
        self.instances.lock().len()
    }

    fn instance(&self, spec: &str, parsed: &ParsedSpec) -> Result<Arc<Instance>, ValueError> {
        let mut instances = self.instances.lock();
        if let Some(instance) = instances.get(spec) {
            return Ok(instance.clone());
        }
        let built = Arc::new(build_instance(spec, parsed)?);
        instances.insert(spec.to_string(), built.clone());
        tracing::debug!(spec, kind = ?parsed.kind, "built interpolator instance");
        Ok(built)
    }

    async fn apply(
        &self,
        spec: &str,
        instance: &Instance,
        context: &ResolutionContext,
    ) -> Result<Value, ValueError> {
        let hour = decimal_hour(context.now);
        match instance {
            Instance::Linear(series) => {
                let value = series.linear_at(spec, hour)?;
                Ok(Value::from(value))
            }
            Instance::StepBefore(series) => Ok(series.step_at(hour, StepMode::Before)),
            Instance::StepAfter(series) => Ok(series.step_at(hour, StepMode::After)),
            Instance::RandomLinear(series) => Ok(series.sample_at(hour)),
            Instance::DateIncrement(increment) => Ok(Value::from(increment.value_at(context.now))),
            Instance::MultilinePosition(line) => Ok(line.position_at(hour)),
            Instance::MultilineBearing(line) => Ok(line.bearing_at(hour)),
            Instance::TextRotation { rotation, reference } => {
                let reference_at = {
                    let mut slot = reference.lock();
                    *slot.get_or_insert(context.now)
                };
                Ok(rotation.value_at(reference_at, context.now))
            }
            Instance::Function(function) => {
                function
                    .resolve(
                        spec,
                        context.now,
                        context.token.as_deref(),
                        &self.globals,
                        self.lookup.as_ref(),
                    )
                    .await
            }
        }
    }
}

fn build_instance(spec: &str, parsed: &ParsedSpec) -> Result<Instance, ValueError> {
    let payload = parsed.payload.as_str();
    Ok(match parsed.kind {
        InterpolatorKind::TimeLinear => Instance::Linear(TimeSeries::from_payload(spec, payload)?),
        InterpolatorKind::TimeStepBefore => {
            Instance::StepBefore(TimeSeries::from_payload(spec, payload)?)
        }
        InterpolatorKind::TimeStepAfter => {
            Instance::StepAfter(TimeSeries::from_payload(spec, payload)?)
        }
        InterpolatorKind::TimeRandomLinear => {
            Instance::RandomLinear(RandomSeries::from_payload(spec, payload)?)
        }
        InterpolatorKind::DateIncrement => {
            Instance::DateIncrement(DateIncrement::from_payload(spec, payload)?)
        }
        InterpolatorKind::MultilinePosition => {
            Instance::MultilinePosition(Multiline::from_payload(spec, payload)?)
        }
        InterpolatorKind::MultilineBearing => {
            Instance::MultilineBearing(Multiline::from_payload(spec, payload)?)
        }
        InterpolatorKind::TextRotation => Instance::TextRotation {
            rotation: TextRotation::from_payload(spec, payload)?,
            reference: Mutex::new(None),
        },
        InterpolatorKind::AttributeFunction => {
            Instance::Function(FunctionInterpolator::from_payload(spec, payload)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::NoLookup;
    use chrono::TimeZone;

    fn resolver() -> Resolver {
        Resolver::new(Arc::new(NoLookup))
    }

    fn context(hour: u32) -> ResolutionContext {
        ResolutionContext {
            now: Utc.with_ymd_and_hms(2016, 10, 20, hour, 0, 0).unwrap(),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_literal_passthrough() {
        let r = resolver();
        let zero = Value::from(0);
        assert_eq!(r.resolve(&zero, &context(6)).await.unwrap(), zero);
        let text = Value::from("just text");
        assert_eq!(r.resolve(&text, &context(6)).await.unwrap(), text);
    }

    #[tokio::test]
    async fn test_linear_resolution() {
        let r = resolver();
        let spec = Value::from("time-linear-interpolator([[0,0],[12,50],[24,100]])");
        let value = r.resolve(&spec, &context(6)).await.unwrap();
        assert!((value.as_f64().unwrap() - 25.0).abs() < 1e-9);
        let value = r.resolve(&spec, &context(18)).await.unwrap();
        assert!((value.as_f64().unwrap() - 75.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_instances_are_cached_per_specification() {
        let r = resolver();
        let spec = Value::from("attribute-function-interpolator(state n = 0; n = n + 1; n)");
        assert_eq!(r.resolve(&spec, &context(1)).await.unwrap(), Value::from(1));
        assert_eq!(r.resolve(&spec, &context(2)).await.unwrap(), Value::from(2));
        assert_eq!(r.cached_instances(), 1);
    }

    #[tokio::test]
    async fn test_malformed_spec_is_invalid() {
        let r = resolver();
        let spec = Value::from("time-linear-interpolator(not json)");
        let err = r.resolve(&spec, &context(0)).await.unwrap_err();
        assert!(err.is_invalid_spec());
    }

    #[tokio::test]
    async fn test_independent_resolvers_do_not_share_state() {
        let spec = Value::from("attribute-function-interpolator(state n = 0; n = n + 1; n)");
        let first = resolver();
        assert_eq!(first.resolve(&spec, &context(1)).await.unwrap(), Value::from(1));
        let second = resolver();
        assert_eq!(second.resolve(&spec, &context(1)).await.unwrap(), Value::from(1));
    }
}
