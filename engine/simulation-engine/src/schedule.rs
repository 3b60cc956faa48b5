//! Schedules: one-shot, recurring, and window-bounded recurring
//!
//! Attributes sharing the same schedule value are grouped into one job, so
//! schedules compare and hash by value.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::CronExpr;
use crate::error::SimulationError;

/// Delay before a `"once"` schedule fires, in milliseconds
pub const ONCE_FIRE_DELAY_MS: i64 = 500;

/// A schedule as it appears in the configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSpec {
    /// `"once"` or a cron expression
    Rule(String),
    /// A cron rule bounded by a validity window
    Bounded { rule: String, start: DateTime<Utc>, end: DateTime<Utc> },
}

/// A parsed schedule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Schedule {
    Once,
    Cron(CronExpr),
    BoundedCron { expr: CronExpr, start: DateTime<Utc>, end: DateTime<Utc> },
}

impl Schedule {
    /// Parse a configuration schedule, validating cron syntax and window
    pub fn parse(spec: &ScheduleSpec) -> Result<Self, SimulationError> {
        match spec {
            ScheduleSpec::Rule(rule) if rule == "once" => Ok(Schedule::Once),
            ScheduleSpec::Rule(rule) => Ok(Schedule::Cron(CronExpr::parse(rule)?)),
            ScheduleSpec::Bounded { rule, start, end } => {
                if start >= end {
                    return Err(SimulationError::ConfigurationNotValid(format!(
                        "schedule window start {start} is not before end {end}"
                    )));
                }
                Ok(Schedule::BoundedCron { expr: CronExpr::parse(rule)?, start: *start, end: *end })
            }
        }
    }

    /// First invocation at or after the given instant
    pub fn first_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once => Some(now + Duration::milliseconds(ONCE_FIRE_DELAY_MS)),
            Schedule::Cron(expr) => expr.next_after(now),
            Schedule::BoundedCron { expr, start, end } => {
                let from = if now > *start { now } else { *start };
                expr.next_after(from).filter(|at| at <= end)
            }
        }
    }

    /// Invocation following a firing; `None` when the schedule is exhausted
    pub fn next_after(&self, fired_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once => None,
            Schedule::Cron(expr) => expr.next_after(fired_at),
            Schedule::BoundedCron { expr, end, .. } => {
                expr.next_after(fired_at).filter(|at| at <= end)
            }
        }
    }

    /// Human-readable form for the event feed
    pub fn describe(&self) -> String {
        match self {
            Schedule::Once => "once".to_string(),
            Schedule::Cron(expr) => expr.source().to_string(),
            Schedule::BoundedCron { expr, start, end } => {
                format!("{} [{start} .. {end}]", expr.source())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 10, 20, h, m, 0).unwrap()
    }

    #[test]
    fn test_once_fires_shortly_after_scheduling_then_never_again() {
        let schedule = Schedule::parse(&ScheduleSpec::Rule("once".to_string())).unwrap();
        let first = schedule.first_after(at(12, 0)).unwrap();
        assert_eq!(first, at(12, 0) + Duration::milliseconds(ONCE_FIRE_DELAY_MS));
        assert!(schedule.next_after(first).is_none());
    }

    #[test]
    fn test_cron_schedule_recurs() {
        let schedule = Schedule::parse(&ScheduleSpec::Rule("*/10 * * * *".to_string())).unwrap();
        let first = schedule.first_after(at(12, 1)).unwrap();
        assert_eq!(first, at(12, 10));
        assert_eq!(schedule.next_after(first).unwrap(), at(12, 20));
    }

    #[test]
    fn test_bounded_schedule_exhausts_at_window_end() {
        let spec = ScheduleSpec::Bounded {
            rule: "*/10 * * * *".to_string(),
            start: at(12, 0),
            end: at(12, 25),
        };
        let schedule = Schedule::parse(&spec).unwrap();
        // Before the window: clamped to the window start
        let first = schedule.first_after(at(9, 0)).unwrap();
        assert_eq!(first, at(12, 10));
        assert_eq!(schedule.next_after(first).unwrap(), at(12, 20));
        assert!(schedule.next_after(at(12, 20)).is_none());
    }

    #[test]
    fn test_invalid_window_rejected() {
        let spec = ScheduleSpec::Bounded {
            rule: "* * * * *".to_string(),
            start: at(13, 0),
            end: at(12, 0),
        };
        assert!(Schedule::parse(&spec).is_err());
    }

    #[test]
    fn test_equal_schedules_group_by_value() {
        let a = Schedule::parse(&ScheduleSpec::Rule("*/5 * * * *".to_string())).unwrap();
        let b = Schedule::parse(&ScheduleSpec::Rule("*/5 * * * *".to_string())).unwrap();
        assert_eq!(a, b);
        use std::collections::HashMap;
        let mut groups: HashMap<Schedule, u32> = HashMap::new();
        *groups.entry(a).or_default() += 1;
        *groups.entry(b).or_default() += 1;
        assert_eq!(groups.len(), 1);
    }
}
