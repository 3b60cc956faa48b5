//! Interpolator specification parsing
//!
//! A specification string has the shape `kind(payload)`. The payload is JSON
//! for most kinds; the random-linear payload additionally allows bare
//! `random(lo,hi)` range terms, and the attribute-function payload is either
//! a JSON literal or an expression script.

use serde_json::Value;

use crate::error::ValueError;

/// The interpolator kinds recognized in attribute values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterpolatorKind {
    TimeLinear,
    TimeStepBefore,
    TimeStepAfter,
    TimeRandomLinear,
    DateIncrement,
    MultilinePosition,
    MultilineBearing,
    TextRotation,
    AttributeFunction,
}

impl InterpolatorKind {
    /// The specification prefix for this kind
    pub fn prefix(&self) -> &'static str {
        match self {
            InterpolatorKind::TimeLinear => "time-linear-interpolator",
            InterpolatorKind::TimeStepBefore => "time-step-before-interpolator",
            InterpolatorKind::TimeStepAfter => "time-step-after-interpolator",
            InterpolatorKind::TimeRandomLinear => "time-random-linear-interpolator",
            InterpolatorKind::DateIncrement => "date-increment-interpolator",
            InterpolatorKind::MultilinePosition => "multiline-position-interpolator",
            InterpolatorKind::MultilineBearing => "multiline-bearing-interpolator",
            InterpolatorKind::TextRotation => "text-rotation-interpolator",
            InterpolatorKind::AttributeFunction => "attribute-function-interpolator",
        }
    }

    const ALL: [InterpolatorKind; 9] = [
        InterpolatorKind::TimeLinear,
        InterpolatorKind::TimeStepBefore,
        InterpolatorKind::TimeStepAfter,
        InterpolatorKind::TimeRandomLinear,
        InterpolatorKind::DateIncrement,
        InterpolatorKind::MultilinePosition,
        InterpolatorKind::MultilineBearing,
        InterpolatorKind::TextRotation,
        InterpolatorKind::AttributeFunction,
    ];
}

/// A recognized specification split into its kind and raw payload text
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSpec {
    pub kind: InterpolatorKind,
    pub payload: String,
}

/// Split a value string into kind and payload.
///
/// Returns `None` when the string does not carry a recognized interpolator
/// prefix, in which case the caller treats it as a literal.
pub fn parse_spec(value: &str) -> Option<Result<ParsedSpec, ValueError>> {
    let trimmed = value.trim();
    for kind in InterpolatorKind::ALL {
        let prefix = kind.prefix();
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let rest = rest.trim();
            if !rest.starts_with('(') || !rest.ends_with(')') {
                return Some(Err(ValueError::invalid(
                    value,
                    format!("expected {prefix}(<payload>)"),
                )));
            }
            let payload = rest[1..rest.len() - 1].trim().to_string();
            return Some(Ok(ParsedSpec { kind, payload }));
        }
    }
    None
}

/// Parse a payload that must be JSON
pub fn json_payload(spec: &str, payload: &str) -> Result<Value, ValueError> {
    serde_json::from_str(payload)
        .map_err(|e| ValueError::invalid(spec, format!("payload is not valid JSON: {e}")))
}

/// Rewrite bare `random(lo,hi)` terms into `{"random":[lo,hi]}` objects so the
/// random-linear payload becomes plain JSON.
pub fn normalize_random_terms(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut rest = payload;
    while let Some(pos) = rest.find("random(") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + "random(".len()..];
        match after.find(')') {
            Some(close) => {
                let args = &after[..close];
                out.push_str("{\"random\":[");
                out.push_str(args);
                out.push_str("]}");
                rest = &after[close + 1..];
            }
            None => {
                // Unbalanced call, keep the text and let JSON parsing report it
                out.push_str(&rest[pos..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
