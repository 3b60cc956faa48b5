//! Five-field cron expressions
//!
//! A dedicated expression type (`minute hour day-of-month month day-of-week`)
//! parsed once at scheduling time, independent of any scheduling library's
//! string dialect. Supports `*`, lists, ranges and `/step`. Day-of-month and
//! day-of-week combine with the classic cron OR rule when both are
//! restricted.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::SimulationError;

/// Upper bound on the search horizon for the next occurrence, in days
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CronExpr {
    source: String,
    minutes: Vec<u8>,
    hours: Vec<u8>,
    dom: Vec<u8>,
    months: Vec<u8>,
    dow: Vec<u8>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parse a `minute hour day-of-month month day-of-week` expression
    pub fn parse(source: &str) -> Result<Self, SimulationError> {
        let fields: Vec<&str> = source.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SimulationError::ConfigurationNotValid(format!(
                "cron expression '{source}' must have 5 fields"
            )));
        }
        let (minutes, _) = parse_field(source, fields[0], 0, 59)?;
        let (hours, _) = parse_field(source, fields[1], 0, 23)?;
        let (dom, dom_restricted) = parse_field(source, fields[2], 1, 31)?;
        let (months, _) = parse_field(source, fields[3], 1, 12)?;
        let (mut dow, dow_restricted) = parse_field(source, fields[4], 0, 7)?;
        // 7 is an alias for Sunday
        for day in dow.iter_mut() {
            if *day == 7 {
                *day = 0;
            }
        }
        dow.sort_unstable();
        dow.dedup();
        Ok(Self {
            source: source.to_string(),
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_restricted,
            dow_restricted,
        })
    }

    /// The expression as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The first occurrence strictly after the given instant
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (after + Duration::minutes(1))
            .with_second(0)
            .and_then(|at| at.with_nanosecond(0))?;
        let start_date = start.date_naive();

        for offset in 0..SEARCH_HORIZON_DAYS {
            let date = start_date + Duration::days(offset);
            if !self.day_matches(date) {
                continue;
            }
            let (first_hour, first_minute) = if offset == 0 {
                (start.hour() as u8, start.minute() as u8)
            } else {
                (0, 0)
            };
            for &hour in self.hours.iter().filter(|&&h| h >= first_hour) {
                let minute_floor = if hour == first_hour { first_minute } else { 0 };
                if let Some(&minute) = self.minutes.iter().find(|&&m| m >= minute_floor) {
                    let at = date.and_hms_opt(u32::from(hour), u32::from(minute), 0)?;
                    return Some(Utc.from_utc_datetime(&at));
                }
            }
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&(date.month() as u8)) {
            return false;
        }
        let dom_hit = self.dom.contains(&(date.day() as u8));
        let dow_hit = self.dow.contains(&(date.weekday().num_days_from_sunday() as u8));
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_hit || dow_hit,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (false, false) => true,
        }
    }
}

/// Parse one field into its sorted value set; the flag reports whether the
/// field restricts values (anything but a bare `*`).
fn parse_field(
    source: &str,
    field: &str,
    min: u8,
    max: u8,
) -> Result<(Vec<u8>, bool), SimulationError> {
    let invalid = |reason: String| {
        SimulationError::ConfigurationNotValid(format!("cron expression '{source}': {reason}"))
    };

    let mut values = Vec::new();
    let mut restricted = false;
    for term in field.split(',') {
        let (range, step) = match term.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| invalid(format!("invalid step '{step}'")))?;
                if step == 0 {
                    return Err(invalid("step must be positive".to_string()));
                }
                (range, step)
            }
            None => (term, 1),
        };
        let (lo, hi) = if range == "*" {
            if step == 1 && field == "*" {
                // Bare wildcard: all values, unrestricted
                (min, max)
            } else {
                restricted = true;
                (min, max)
            }
        } else {
            restricted = true;
            match range.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u8 = lo.parse().map_err(|_| invalid(format!("invalid value '{lo}'")))?;
                    let hi: u8 = hi.parse().map_err(|_| invalid(format!("invalid value '{hi}'")))?;
                    (lo, hi)
                }
                None => {
                    let value: u8 =
                        range.parse().map_err(|_| invalid(format!("invalid value '{range}'")))?;
                    (value, value)
                }
            }
        };
        if lo < min || hi > max || lo > hi {
            return Err(invalid(format!("range {lo}-{hi} outside {min}-{max}")));
        }
        let mut value = lo;
        loop {
            values.push(value);
            match value.checked_add(step) {
                Some(next) if next <= hi => value = next,
                _ => break,
            }
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok((values, restricted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_five_minutes() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        let next = expr.next_after(at(2016, 10, 20, 12, 3, 10)).unwrap();
        assert_eq!(next, at(2016, 10, 20, 12, 5, 0));
        let next = expr.next_after(at(2016, 10, 20, 12, 55, 0)).unwrap();
        assert_eq!(next, at(2016, 10, 20, 13, 0, 0));
    }

    #[test]
    fn test_next_is_strictly_after() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        let next = expr.next_after(at(2016, 10, 20, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2016, 10, 20, 13, 0, 0));
    }

    #[test]
    fn test_daily_at_noon() {
        let expr = CronExpr::parse("30 12 * * *").unwrap();
        let next = expr.next_after(at(2016, 10, 20, 13, 0, 0)).unwrap();
        assert_eq!(next, at(2016, 10, 21, 12, 30, 0));
    }

    #[test]
    fn test_day_of_week() {
        // 2016-10-20 is a Thursday; next Monday is the 24th
        let expr = CronExpr::parse("0 9 * * 1").unwrap();
        let next = expr.next_after(at(2016, 10, 20, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2016, 10, 24, 9, 0, 0));
    }

    #[test]
    fn test_dom_dow_or_rule() {
        // Both restricted: fires on the 21st (Friday) because dom matches,
        // even though dow asks for Monday
        let expr = CronExpr::parse("0 0 21 * 1").unwrap();
        let next = expr.next_after(at(2016, 10, 20, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2016, 10, 21, 0, 0, 0));
    }

    #[test]
    fn test_month_rollover() {
        let expr = CronExpr::parse("0 0 1 * *").unwrap();
        let next = expr.next_after(at(2016, 12, 15, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2017, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }

    #[test]
    fn test_equality_by_source_groups_schedules() {
        let a = CronExpr::parse("*/5 * * * *").unwrap();
        let b = CronExpr::parse("*/5 * * * *").unwrap();
        assert_eq!(a, b);
    }
}
