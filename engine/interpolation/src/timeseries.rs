//! Time series interpolators over one 24-hour cycle
//!
//! Keys are decimal hours (`hour + minute/60 + second/3600`). The cycle wraps
//! across midnight: past the last key the series continues into the first key
//! of the next day.

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use serde_json::Value;

use crate::error::ValueError;
use crate::spec::{json_payload, normalize_random_terms};
use crate::HOURS_PER_CYCLE;

/// Decimal hour of the day for an instant
pub fn decimal_hour(at: DateTime<Utc>) -> f64 {
    f64::from(at.hour())
        + f64::from(at.minute()) / 60.0
        + f64::from(at.second()) / 3600.0
}

/// Step interpolation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Value of the last key at or before the current hour
    Before,
    /// Value of the first key at or after the current hour
    After,
}

/// A sorted `[decimalHour, value]` series
#[derive(Debug, Clone)]
pub struct TimeSeries {
    entries: Vec<(f64, Value)>,
}

impl TimeSeries {
    /// Parse a series from a JSON array payload
    pub fn from_payload(spec: &str, payload: &str) -> Result<Self, ValueError> {
        let raw = json_payload(spec, payload)?;
        let entries = parse_entries(spec, &raw)?;
        Ok(Self { entries })
    }

    /// Linear interpolation between the two bracketing keys
    pub fn linear_at(&self, spec: &str, hour: f64) -> Result<f64, ValueError> {
        let hours: Vec<f64> = self.entries.iter().map(|(h, _)| *h).collect();
        let (left, right, fraction) = bracket(&hours, hour);
        let lo = numeric(spec, &self.entries[left].1)?;
        let hi = numeric(spec, &self.entries[right].1)?;
        Ok(lo + (hi - lo) * fraction)
    }

    /// Step interpolation, keeping the prior or next key's value
    pub fn step_at(&self, hour: f64, mode: StepMode) -> Value {
        match mode {
            StepMode::Before => {
                let last_at_or_before =
                    self.entries.iter().rev().find(|(h, _)| *h <= hour);
                match last_at_or_before {
                    Some((_, v)) => v.clone(),
                    // Before the first key the previous day's last key applies
                    None => self.entries.last().map(|(_, v)| v.clone()).unwrap_or(Value::Null),
                }
            }
            StepMode::After => {
                let first_at_or_after = self.entries.iter().find(|(h, _)| *h >= hour);
                match first_at_or_after {
                    Some((_, v)) => v.clone(),
                    // Past the last key the next day's first key applies
                    None => self.entries.first().map(|(_, v)| v.clone()).unwrap_or(Value::Null),
                }
            }
        }
    }
}

/// Find the bracketing key indices and the interpolation fraction, wrapping
/// from the last key to the first across midnight.
fn bracket(hours: &[f64], hour: f64) -> (usize, usize, f64) {
    let n = hours.len();
    if n == 1 {
        return (0, 0, 0.0);
    }
    for i in 0..n - 1 {
        let (h0, h1) = (hours[i], hours[i + 1]);
        if hour >= h0 && hour <= h1 {
            let span = h1 - h0;
            let fraction = if span > 0.0 { (hour - h0) / span } else { 0.0 };
            return (i, i + 1, fraction);
        }
    }
    // Wrap-around segment between the last and the first key
    let (h_last, h_first) = (hours[n - 1], hours[0]);
    let span = (HOURS_PER_CYCLE - h_last) + h_first;
    let distance = if hour >= h_last { hour - h_last } else { hour + (HOURS_PER_CYCLE - h_last) };
    let fraction = if span > 0.0 { distance / span } else { 0.0 };
    (n - 1, 0, fraction)
}

/// Output rounding for the random-linear interpolator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rounding {
    #[default]
    Float,
    Ceil,
    Floor,
    Round,
}

/// One random-linear key: a fixed number or a sampling range
#[derive(Debug, Clone, Copy)]
enum RandomTerm {
    Fixed(f64),
    Range(f64, f64),
}

impl RandomTerm {
    fn sample(&self) -> f64 {
        match *self {
            RandomTerm::Fixed(v) => v,
            RandomTerm::Range(lo, hi) => {
                if lo >= hi {
                    lo
                } else {
                    rand::thread_rng().gen_range(lo..=hi)
                }
            }
        }
    }

    fn min(&self) -> f64 {
        match *self {
            RandomTerm::Fixed(v) => v,
            RandomTerm::Range(lo, _) => lo,
        }
    }

    fn max(&self) -> f64 {
        match *self {
            RandomTerm::Fixed(v) => v,
            RandomTerm::Range(_, hi) => hi,
        }
    }
}

/// Linear interpolation over keys whose values may be sampling ranges.
///
/// Each resolution samples the bracketing ranges independently before
/// interpolating, so repeated calls at the same hour differ while staying
/// inside the enclosing bounds.
#[derive(Debug, Clone)]
pub struct RandomSeries {
    entries: Vec<(f64, RandomTerm)>,
    rounding: Rounding,
}

impl RandomSeries {
    /// Parse a random-linear payload: a series with optional `random(lo,hi)`
    /// terms, optionally followed by `;return(<mode>)`.
    pub fn from_payload(spec: &str, payload: &str) -> Result<Self, ValueError> {
        let (series_text, rounding) = match payload.split_once(';') {
            Some((series, clause)) => (series.trim(), parse_return_clause(spec, clause.trim())?),
            None => (payload, Rounding::Float),
        };
        let raw = json_payload(spec, &normalize_random_terms(series_text))?;
        let pairs = parse_entries(spec, &raw)?;
        let mut entries = Vec::with_capacity(pairs.len());
        for (hour, value) in pairs {
            entries.push((hour, parse_random_term(spec, &value)?));
        }
        Ok(Self { entries, rounding })
    }

    /// Sample the bracketing keys and interpolate
    pub fn sample_at(&self, hour: f64) -> Value {
        if self.entries.is_empty() {
            return Value::Null;
        }
        let hours: Vec<f64> = self.entries.iter().map(|(h, _)| *h).collect();
        let (left, right, fraction) = bracket(&hours, hour);
        let lo = self.entries[left].1.sample();
        let hi = self.entries[right].1.sample();
        let value = lo + (hi - lo) * fraction;
        match self.rounding {
            Rounding::Float => Value::from(value),
            Rounding::Ceil => Value::from(value.ceil() as i64),
            Rounding::Floor => Value::from(value.floor() as i64),
            Rounding::Round => Value::from(value.round() as i64),
        }
    }

    /// Enclosing bounds of the whole series
    pub fn bounds(&self) -> (f64, f64) {
        let min = self.entries.iter().map(|(_, t)| t.min()).fold(f64::INFINITY, f64::min);
        let max = self.entries.iter().map(|(_, t)| t.max()).fold(f64::NEG_INFINITY, f64::max);
        (min, max)
    }
}

fn parse_entries(spec: &str, raw: &Value) -> Result<Vec<(f64, Value)>, ValueError> {
    let array = raw
        .as_array()
        .ok_or_else(|| ValueError::invalid(spec, "payload must be an array of [hour, value] pairs"))?;
    if array.is_empty() {
        return Err(ValueError::invalid(spec, "payload must not be empty"));
    }
    let mut entries = Vec::with_capacity(array.len());
    for pair in array {
        let items = pair
            .as_array()
            .filter(|items| items.len() == 2)
            .ok_or_else(|| ValueError::invalid(spec, "each entry must be an [hour, value] pair"))?;
        let hour = items[0]
            .as_f64()
            .ok_or_else(|| ValueError::invalid(spec, "entry hour must be a number"))?;
        if !(0.0..=HOURS_PER_CYCLE).contains(&hour) {
            return Err(ValueError::invalid(spec, format!("hour {hour} outside [0, 24]")));
        }
        entries.push((hour, items[1].clone()));
    }
    let sorted = entries.windows(2).all(|w| w[0].0 <= w[1].0);
    if !sorted {
        return Err(ValueError::invalid(spec, "entries must be sorted by hour"));
    }
    Ok(entries)
}

fn numeric(spec: &str, value: &Value) -> Result<f64, ValueError> {
    value
        .as_f64()
        .ok_or_else(|| ValueError::resolution(spec, "linear interpolation requires numeric values"))
}

fn parse_random_term(spec: &str, value: &Value) -> Result<RandomTerm, ValueError> {
    if let Some(v) = value.as_f64() {
        return Ok(RandomTerm::Fixed(v));
    }
    if let Some(range) = value.get("random").and_then(Value::as_array) {
        if range.len() == 2 {
            if let (Some(lo), Some(hi)) = (range[0].as_f64(), range[1].as_f64()) {
                return Ok(RandomTerm::Range(lo, hi));
            }
        }
    }
    Err(ValueError::invalid(spec, "values must be numbers or random(lo,hi) ranges"))
}

fn parse_return_clause(spec: &str, clause: &str) -> Result<Rounding, ValueError> {
    let inner = clause
        .strip_prefix("return(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| ValueError::invalid(spec, "expected return(<float|ceil|floor|round>)"))?;
    match inner.trim() {
        "float" => Ok(Rounding::Float),
        "ceil" => Ok(Rounding::Ceil),
        "floor" => Ok(Rounding::Floor),
        "round" => Ok(Rounding::Round),
        other => Err(ValueError::invalid(spec, format!("unknown return mode '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SPEC: &str = "test-spec";

    fn series(payload: &str) -> TimeSeries {
        TimeSeries::from_payload(SPEC, payload).unwrap()
    }

    #[test]
    fn test_decimal_hour() {
        let at = Utc.with_ymd_and_hms(2016, 10, 20, 6, 30, 0).unwrap();
        assert!((decimal_hour(at) - 6.5).abs() < 1e-9);
    }

    #[test]
    fn test_linear_midpoints() {
        let s = series("[[0,0],[12,50],[24,100]]");
        assert!((s.linear_at(SPEC, 6.0).unwrap() - 25.0).abs() < 1e-9);
        assert!((s.linear_at(SPEC, 18.0).unwrap() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_wraps_to_first_key_at_cycle_end() {
        let s = series("[[0,0],[12,50],[24,100]]");
        // Hour 24 never occurs as a real decimal hour; hour 0 is the wrap target
        assert!((s.linear_at(SPEC, 0.0).unwrap() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_wraparound_segment() {
        let s = series("[[6,10],[18,20]]");
        // Midnight sits halfway through the 18 -> 6 wrap segment
        assert!((s.linear_at(SPEC, 0.0).unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_step_before_keeps_prior_key() {
        let s = series("[[0,0],[12,50],[24,100]]");
        assert_eq!(s.step_at(11.9, StepMode::Before), Value::from(0));
        assert_eq!(s.step_at(12.0, StepMode::Before), Value::from(50));
    }

    #[test]
    fn test_step_after_takes_next_key() {
        let s = series("[[0,0],[12,50],[24,100]]");
        assert_eq!(s.step_at(0.1, StepMode::After), Value::from(50));
        assert_eq!(s.step_at(0.0, StepMode::After), Value::from(0));
    }

    #[test]
    fn test_unsorted_entries_rejected() {
        let err = TimeSeries::from_payload(SPEC, "[[12,50],[0,0]]").unwrap_err();
        assert!(err.is_invalid_spec());
    }

    #[test]
    fn test_random_series_stays_within_bounds() {
        let s = RandomSeries::from_payload(SPEC, "[[0,random(0,5)],[24,random(5,10)]]").unwrap();
        let (min, max) = s.bounds();
        for i in 0..1000 {
            let hour = (i % 240) as f64 / 10.0;
            let value = s.sample_at(hour).as_f64().unwrap();
            assert!(value >= min && value <= max, "{value} outside [{min}, {max}]");
        }
    }

    #[test]
    fn test_random_series_return_clause() {
        let s = RandomSeries::from_payload(SPEC, "[[0,random(1,2)],[24,random(1,2)]];return(floor)")
            .unwrap();
        let value = s.sample_at(12.0);
        assert!(value.is_i64());
        assert_eq!(value.as_i64().unwrap(), 1);
    }

    #[test]
    fn test_random_series_fixed_values() {
        let s = RandomSeries::from_payload(SPEC, "[[0,0],[10,10]]").unwrap();
        assert!((s.sample_at(5.0).as_f64().unwrap() - 5.0).abs() < 1e-9);
    }
}
