//! Multiline traversal interpolators
//!
//! A point travels an ordered polyline at constant speed inside a daily
//! validity window expressed in decimal hours. The position interpolator
//! returns the reached coordinate as a GeoJSON point; the bearing
//! interpolator returns the compass bearing of the segment being traversed.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ValueError;
use crate::spec::json_payload;

const EARTH_RADIUS_KM: f64 = 6371.0;
const KM_PER_MILE: f64 = 1.609344;

#[derive(Debug, Clone, Deserialize)]
struct SpeedPayload {
    value: f64,
    units: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WindowPayload {
    from: f64,
    to: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct Payload {
    coordinates: Vec<[f64; 2]>,
    speed: SpeedPayload,
    time: WindowPayload,
}

/// Constant-speed traversal of a polyline inside a daily time window
#[derive(Debug, Clone)]
pub struct Multiline {
    /// `[lng, lat]` vertices
    coordinates: Vec<[f64; 2]>,
    /// Cumulative segment lengths in km, starting at 0 for the first vertex
    cumulative_km: Vec<f64>,
    speed_kmh: f64,
    from_hour: f64,
    to_hour: f64,
}

impl Multiline {
    /// Parse a `{coordinates, speed{value,units}, time{from,to}}` payload
    pub fn from_payload(spec: &str, payload: &str) -> Result<Self, ValueError> {
        let raw = json_payload(spec, payload)?;
        let parsed: Payload = serde_json::from_value(raw).map_err(|e| {
            ValueError::invalid(spec, format!("expected {{coordinates, speed, time}}: {e}"))
        })?;
        if parsed.coordinates.len() < 2 {
            return Err(ValueError::invalid(spec, "at least two coordinates are required"));
        }
        let speed_kmh = match parsed.speed.units.as_str() {
            "km/h" => parsed.speed.value,
            "mi/h" => parsed.speed.value * KM_PER_MILE,
            other => {
                return Err(ValueError::invalid(spec, format!("unknown speed units '{other}'")))
            }
        };
        if speed_kmh <= 0.0 {
            return Err(ValueError::invalid(spec, "speed must be positive"));
        }
        if parsed.time.from >= parsed.time.to {
            return Err(ValueError::invalid(spec, "time window must satisfy from < to"));
        }
        let mut cumulative_km = Vec::with_capacity(parsed.coordinates.len());
        cumulative_km.push(0.0);
        for pair in parsed.coordinates.windows(2) {
            let previous = *cumulative_km.last().unwrap_or(&0.0);
            cumulative_km.push(previous + haversine_km(pair[0], pair[1]));
        }
        Ok(Self {
            coordinates: parsed.coordinates,
            cumulative_km,
            speed_kmh,
            from_hour: parsed.time.from,
            to_hour: parsed.time.to,
        })
    }

    /// GeoJSON point reached at the given decimal hour
    pub fn position_at(&self, hour: f64) -> Value {
        let (point, _) = self.traverse(hour);
        json!({ "type": "Point", "coordinates": [point[0], point[1]] })
    }

    /// Compass bearing (degrees) of the segment being traversed
    pub fn bearing_at(&self, hour: f64) -> Value {
        let (_, segment) = self.traverse(hour);
        let from = self.coordinates[segment];
        let to = self.coordinates[(segment + 1).min(self.coordinates.len() - 1)];
        Value::from(initial_bearing_degrees(from, to))
    }

    /// Point and active segment index after constant-speed travel since `from`
    fn traverse(&self, hour: f64) -> ([f64; 2], usize) {
        let effective = hour.clamp(self.from_hour, self.to_hour);
        let travelled_km = self.speed_kmh * (effective - self.from_hour);
        let total_km = *self.cumulative_km.last().unwrap_or(&0.0);
        if travelled_km <= 0.0 {
            return (self.coordinates[0], 0);
        }
        if travelled_km >= total_km {
            let last = self.coordinates.len() - 1;
            return (self.coordinates[last], last.saturating_sub(1));
        }
        // Locate the segment containing the travelled distance
        let mut segment = 0;
        while segment + 1 < self.cumulative_km.len() && self.cumulative_km[segment + 1] < travelled_km
        {
            segment += 1;
        }
        let segment_start_km = self.cumulative_km[segment];
        let segment_km = self.cumulative_km[segment + 1] - segment_start_km;
        let fraction = if segment_km > 0.0 { (travelled_km - segment_start_km) / segment_km } else { 0.0 };
        let a = self.coordinates[segment];
        let b = self.coordinates[segment + 1];
        let point = [a[0] + (b[0] - a[0]) * fraction, a[1] + (b[1] - a[1]) * fraction];
        (point, segment)
    }
}

/// Great-circle distance between two `[lng, lat]` coordinates in km
fn haversine_km(a: [f64; 2], b: [f64; 2]) -> f64 {
    let (lng1, lat1) = (a[0].to_radians(), a[1].to_radians());
    let (lng2, lat2) = (b[0].to_radians(), b[1].to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Initial great-circle bearing from `a` to `b` in degrees, normalized to [0, 360)
fn initial_bearing_degrees(a: [f64; 2], b: [f64; 2]) -> f64 {
    let (lng1, lat1) = (a[0].to_radians(), a[1].to_radians());
    let (lng2, lat2) = (b[0].to_radians(), b[1].to_radians());
    let dlng = lng2 - lng1;
    let y = dlng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = "test-spec";

    fn collinear() -> Multiline {
        // Three collinear points heading due east along the equator
        Multiline::from_payload(
            SPEC,
            r#"{"coordinates":[[0,0],[1,0],[2,0]],
                "speed":{"value":30,"units":"km/h"},
                "time":{"from":10,"to":22}}"#,
        )
        .unwrap()
    }

    fn point_coordinates(value: &Value) -> [f64; 2] {
        let coords = value["coordinates"].as_array().unwrap();
        [coords[0].as_f64().unwrap(), coords[1].as_f64().unwrap()]
    }

    #[test]
    fn test_clamped_to_first_point_before_window() {
        let line = collinear();
        let point = point_coordinates(&line.position_at(8.0));
        assert_eq!(point, [0.0, 0.0]);
    }

    #[test]
    fn test_clamped_after_window_end() {
        let line = collinear();
        let at_end = point_coordinates(&line.position_at(22.0));
        let after = point_coordinates(&line.position_at(23.5));
        assert_eq!(at_end, after);
    }

    #[test]
    fn test_mid_window_matches_constant_speed_arithmetic() {
        let line = collinear();
        // 1 degree of longitude on the equator is ~111.19 km; at 30 km/h the
        // first vertex is passed after ~3.7 h of travel
        let point = point_coordinates(&line.position_at(12.0));
        assert!(point[0] > 0.0 && point[0] < 2.0);
        let expected_km = 30.0 * 2.0;
        let travelled_deg = point[0];
        let travelled_km = haversine_km([0.0, 0.0], [travelled_deg, 0.0]);
        assert!((travelled_km - expected_km).abs() < 0.5);
    }

    #[test]
    fn test_bearing_due_east() {
        let line = collinear();
        let bearing = line.bearing_at(12.0).as_f64().unwrap();
        assert!((bearing - 90.0).abs() < 1.0);
    }

    #[test]
    fn test_single_coordinate_rejected() {
        let err = Multiline::from_payload(
            SPEC,
            r#"{"coordinates":[[0,0]],"speed":{"value":30,"units":"km/h"},"time":{"from":0,"to":1}}"#,
        )
        .unwrap_err();
        assert!(err.is_invalid_spec());
    }
}
