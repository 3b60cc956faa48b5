//! Text rotation interpolator
//!
//! Rotates through a set of `[threshold, value]` pairs as time elapses since
//! a reference instant, measured in a configurable unit. The reference is the
//! first resolution of the specification within a run. A value entry may be a
//! weighted candidate list `[[weight, text], ...]`; one candidate is drawn by
//! weighted random selection on every call inside that threshold region.

use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use serde_json::Value;

use crate::error::ValueError;
use crate::spec::json_payload;

/// Unit in which elapsed time is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationUnit {
    Seconds,
    Minutes,
    Hours,
    /// Whole 24-hour periods
    Days,
    /// Calendar days crossed
    Dates,
    Months,
    Years,
}

impl RotationUnit {
    fn parse(spec: &str, text: &str) -> Result<Self, ValueError> {
        match text {
            "seconds" => Ok(RotationUnit::Seconds),
            "minutes" => Ok(RotationUnit::Minutes),
            "hours" => Ok(RotationUnit::Hours),
            "days" => Ok(RotationUnit::Days),
            "dates" => Ok(RotationUnit::Dates),
            "months" => Ok(RotationUnit::Months),
            "years" => Ok(RotationUnit::Years),
            other => Err(ValueError::invalid(spec, format!("unknown units '{other}'"))),
        }
    }

    fn elapsed(&self, reference: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        let delta = now - reference;
        match self {
            RotationUnit::Seconds => delta.num_seconds(),
            RotationUnit::Minutes => delta.num_minutes(),
            RotationUnit::Hours => delta.num_hours(),
            RotationUnit::Days => delta.num_days(),
            RotationUnit::Dates => {
                (now.date_naive() - reference.date_naive()).num_days()
            }
            RotationUnit::Months => {
                i64::from(now.year() - reference.year()) * 12
                    + i64::from(now.month() as i32 - reference.month() as i32)
            }
            RotationUnit::Years => i64::from(now.year() - reference.year()),
        }
    }
}

/// One rotation entry
#[derive(Debug, Clone)]
enum RotationValue {
    Plain(Value),
    Weighted(Vec<(f64, Value)>),
}

/// Parsed text-rotation interpolator
#[derive(Debug, Clone)]
pub struct TextRotation {
    unit: RotationUnit,
    entries: Vec<(i64, RotationValue)>,
}

impl TextRotation {
    /// Parse a `{units, text:[[threshold, value],...]}` payload
    pub fn from_payload(spec: &str, payload: &str) -> Result<Self, ValueError> {
        let raw = json_payload(spec, payload)?;
        let units = raw
            .get("units")
            .and_then(Value::as_str)
            .ok_or_else(|| ValueError::invalid(spec, "missing 'units'"))?;
        let unit = RotationUnit::parse(spec, units)?;
        let text = raw
            .get("text")
            .and_then(Value::as_array)
            .ok_or_else(|| ValueError::invalid(spec, "missing 'text' array"))?;
        if text.is_empty() {
            return Err(ValueError::invalid(spec, "'text' must not be empty"));
        }
        let mut entries = Vec::with_capacity(text.len());
        for pair in text {
            let items = pair
                .as_array()
                .filter(|items| items.len() == 2)
                .ok_or_else(|| ValueError::invalid(spec, "each entry must be [threshold, value]"))?;
            let threshold = items[0]
                .as_i64()
                .ok_or_else(|| ValueError::invalid(spec, "threshold must be an integer"))?;
            entries.push((threshold, parse_rotation_value(spec, &items[1])?));
        }
        entries.sort_by_key(|(threshold, _)| *threshold);
        Ok(Self { unit, entries })
    }

    /// Value active after the given elapsed time since the reference instant
    pub fn value_at(&self, reference: DateTime<Utc>, now: DateTime<Utc>) -> Value {
        let elapsed = self.unit.elapsed(reference, now);
        let active = self.entries.iter().rev().find(|(threshold, _)| *threshold <= elapsed);
        match active {
            None => Value::Null,
            Some((_, RotationValue::Plain(value))) => value.clone(),
            Some((_, RotationValue::Weighted(candidates))) => weighted_choice(candidates),
        }
    }
}

fn parse_rotation_value(spec: &str, value: &Value) -> Result<RotationValue, ValueError> {
    let Some(array) = value.as_array() else {
        return Ok(RotationValue::Plain(value.clone()));
    };
    let mut candidates = Vec::with_capacity(array.len());
    for item in array {
        let pair = item
            .as_array()
            .filter(|pair| pair.len() == 2)
            .ok_or_else(|| ValueError::invalid(spec, "weighted entries must be [weight, value]"))?;
        let weight = pair[0]
            .as_f64()
            .filter(|w| *w > 0.0)
            .ok_or_else(|| ValueError::invalid(spec, "weights must be positive numbers"))?;
        candidates.push((weight, pair[1].clone()));
    }
    if candidates.is_empty() {
        return Err(ValueError::invalid(spec, "weighted entries must not be empty"));
    }
    Ok(RotationValue::Weighted(candidates))
}

fn weighted_choice(candidates: &[(f64, Value)]) -> Value {
    let total: f64 = candidates.iter().map(|(w, _)| *w).sum();
    let mut draw = rand::thread_rng().gen_range(0.0..total);
    for (weight, value) in candidates {
        if draw < *weight {
            return value.clone();
        }
        draw -= weight;
    }
    candidates.last().map(|(_, v)| v.clone()).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const SPEC: &str = "test-spec";

    fn rotation(payload: &str) -> TextRotation {
        TextRotation::from_payload(SPEC, payload).unwrap()
    }

    #[test]
    fn test_highest_threshold_not_exceeding_elapsed_wins() {
        let r = rotation(r#"{"units":"seconds","text":[[0,"PENDING"],[15,"OK"],[45,"CLOSED"]]}"#);
        let reference = Utc.with_ymd_and_hms(2016, 10, 20, 0, 0, 0).unwrap();
        assert_eq!(r.value_at(reference, reference), Value::from("PENDING"));
        assert_eq!(r.value_at(reference, reference + Duration::seconds(20)), Value::from("OK"));
        assert_eq!(r.value_at(reference, reference + Duration::seconds(45)), Value::from("CLOSED"));
    }

    #[test]
    fn test_null_before_first_threshold() {
        let r = rotation(r#"{"units":"minutes","text":[[5,"LATE"]]}"#);
        let reference = Utc.with_ymd_and_hms(2016, 10, 20, 0, 0, 0).unwrap();
        assert_eq!(r.value_at(reference, reference + Duration::minutes(2)), Value::Null);
    }

    #[test]
    fn test_weighted_candidates_stay_in_set() {
        let r = rotation(r#"{"units":"seconds","text":[[0,[[80,"RED"],[20,"BLUE"]]]]}"#);
        let reference = Utc.with_ymd_and_hms(2016, 10, 20, 0, 0, 0).unwrap();
        for _ in 0..200 {
            let value = r.value_at(reference, reference + Duration::seconds(1));
            let text = value.as_str().unwrap();
            assert!(text == "RED" || text == "BLUE");
        }
    }

    #[test]
    fn test_month_elapsed_unit() {
        let r = rotation(r#"{"units":"months","text":[[0,"Q1"],[3,"Q2"]]}"#);
        let reference = Utc.with_ymd_and_hms(2016, 1, 15, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2016, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(r.value_at(reference, later), Value::from("Q2"));
    }

    #[test]
    fn test_unknown_units_rejected() {
        let err =
            TextRotation::from_payload(SPEC, r#"{"units":"fortnights","text":[[0,"A"]]}"#).unwrap_err();
        assert!(err.is_invalid_spec());
    }
}
