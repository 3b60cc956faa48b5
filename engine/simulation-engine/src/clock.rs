//! Real and virtual simulation clocks
//!
//! With a `fromDate` the run replaces wall-clock time by a controllable
//! virtual clock. The scheduler advances it to the next pending invocation
//! once all due work has completed its round-trips, so fast-forward runs stay
//! deterministic.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// The time source of one simulation run
#[derive(Clone)]
pub enum SimClock {
    Real,
    Virtual(Arc<RwLock<DateTime<Utc>>>),
}

impl SimClock {
    /// A wall-clock time source
    pub fn real() -> Self {
        SimClock::Real
    }

    /// A virtual clock initialized to the given instant
    pub fn virtual_from(at: DateTime<Utc>) -> Self {
        SimClock::Virtual(Arc::new(RwLock::new(at)))
    }

    /// Current simulation time
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            SimClock::Real => Utc::now(),
            SimClock::Virtual(at) => *at.read(),
        }
    }

    /// True in fast-forward mode
    pub fn is_virtual(&self) -> bool {
        matches!(self, SimClock::Virtual(_))
    }

    /// Advance a virtual clock; no-op on the real clock
    pub fn advance_to(&self, at: DateTime<Utc>) {
        if let SimClock::Virtual(slot) = self {
            let mut current = slot.write();
            if at > *current {
                *current = at;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_virtual_clock_advances_monotonically() {
        let start = Utc.with_ymd_and_hms(2016, 10, 20, 0, 0, 0).unwrap();
        let clock = SimClock::virtual_from(start);
        assert_eq!(clock.now(), start);

        let later = start + chrono::Duration::hours(1);
        clock.advance_to(later);
        assert_eq!(clock.now(), later);

        // Never moves backwards
        clock.advance_to(start);
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn test_real_clock_tracks_wall_time() {
        let clock = SimClock::real();
        assert!(!clock.is_virtual());
        let delta = (Utc::now() - clock.now()).num_seconds().abs();
        assert!(delta <= 1);
    }
}
