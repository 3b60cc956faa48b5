//! Date increment interpolator
//!
//! Produces a date offset from an origin by a configured number of seconds.
//! With the `"now"` origin the produced date follows the simulation clock, so
//! the offset from the run start grows monotonically with simulated time.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::error::ValueError;
use crate::spec::json_payload;

#[derive(Debug, Clone, Deserialize)]
struct Payload {
    #[serde(default)]
    origin: Option<String>,
    increment: i64,
}

/// Origin of the produced dates
#[derive(Debug, Clone)]
enum Origin {
    /// The simulation clock at each resolution
    Now,
    /// A fixed instant
    Fixed(DateTime<Utc>),
}

/// Parsed date-increment interpolator
#[derive(Debug, Clone)]
pub struct DateIncrement {
    origin: Origin,
    increment_seconds: i64,
}

impl DateIncrement {
    /// Parse a `{origin?, increment}` payload; origin defaults to `"now"`
    pub fn from_payload(spec: &str, payload: &str) -> Result<Self, ValueError> {
        let raw = json_payload(spec, payload)?;
        let parsed: Payload = serde_json::from_value(raw)
            .map_err(|e| ValueError::invalid(spec, format!("expected {{origin?, increment}}: {e}")))?;
        let origin = match parsed.origin.as_deref() {
            None | Some("now") => Origin::Now,
            Some(text) => {
                let fixed = DateTime::parse_from_rfc3339(text)
                    .map_err(|e| ValueError::invalid(spec, format!("invalid origin date: {e}")))?;
                Origin::Fixed(fixed.with_timezone(&Utc))
            }
        };
        Ok(Self { origin, increment_seconds: parsed.increment })
    }

    /// The produced date at the given simulation instant, ISO-8601 encoded
    pub fn value_at(&self, now: DateTime<Utc>) -> String {
        let base = match self.origin {
            Origin::Now => now,
            Origin::Fixed(at) => at,
        };
        (base + Duration::seconds(self.increment_seconds))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SPEC: &str = "test-spec";

    #[test]
    fn test_now_origin_follows_the_clock() {
        let inc = DateIncrement::from_payload(SPEC, r#"{"origin":"now","increment":3600}"#).unwrap();
        let now = Utc.with_ymd_and_hms(2016, 10, 20, 12, 0, 0).unwrap();
        assert_eq!(inc.value_at(now), "2016-10-20T13:00:00.000Z");
        let later = now + Duration::seconds(30);
        assert_eq!(inc.value_at(later), "2016-10-20T13:00:30.000Z");
    }

    #[test]
    fn test_fixed_origin_is_constant() {
        let inc = DateIncrement::from_payload(
            SPEC,
            r#"{"origin":"2016-10-20T00:00:00Z","increment":86400}"#,
        )
        .unwrap();
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(inc.value_at(now), "2016-10-21T00:00:00.000Z");
    }

    #[test]
    fn test_missing_increment_is_invalid() {
        let err = DateIncrement::from_payload(SPEC, r#"{"origin":"now"}"#).unwrap_err();
        assert!(err.is_invalid_spec());
    }
}
