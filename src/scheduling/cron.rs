//! Cron expressions evaluated in an IANA timezone.
//!
//! Accepts six- or seven-field expressions (seconds first) as understood by
//! the `cron` crate, and classic five-field crontab expressions. A five-field
//! expression gets a leading `0` seconds field, and its numeric day-of-week
//! values (crontab `0`-`7`, Sunday = 0 or 7) become day names so they keep
//! their crontab meaning.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("cron expression '{0}' has no upcoming fire time")]
    NoUpcomingFire(String),
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron schedule bound to a timezone
#[derive(Debug, Clone)]
pub struct CronSpec {
    expression: String,
    timezone: Tz,
    schedule: cron::Schedule,
}

impl CronSpec {
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, CronError> {
        let timezone = Tz::from_str(timezone.trim())
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;

        let normalized = normalize(expression)?;
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: expression.trim().to_string(),
            timezone,
            schedule,
        })
    }

    /// The expression as written
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Next fire time and how long until it
    pub fn duration_until_next(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, Duration), CronError> {
        let next = self
            .next_after(now)
            .ok_or_else(|| CronError::NoUpcomingFire(self.expression.clone()))?;
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        Ok((next, wait))
    }
}

fn normalize(expression: &str) -> Result<String, CronError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            crontab_day_of_week(fields[4])
        )),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(CronError::InvalidExpression {
            expression: expression.to_string(),
            reason: format!("expected 5, 6 or 7 fields, found {n}"),
        }),
    }
}

fn crontab_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(crontab_day_item)
        .collect::<Vec<_>>()
        .join(",")
}

/// One comma-separated day-of-week item
///
/// A plain ascending range stays a range of names. A range that wraps past
/// Saturday (`5-7`, `6-0`) or carries a step becomes an explicit list, since
/// the `cron` crate numbers Sunday first and rejects descending ranges.
/// Anything not numeric is passed through for the `cron` crate to judge.
fn crontab_day_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (start, Some(end)),
        None => (range, None),
    };

    let Some(start) = crontab_day(start) else {
        return item.to_string();
    };
    let Some(end) = end.map(crontab_day) else {
        let name = DAY_NAMES[start % 7];
        return match step {
            Some(step) => format!("{name}/{step}"),
            None => name.to_string(),
        };
    };
    let Some(end) = end else {
        return item.to_string();
    };
    let step = match step.map(str::parse::<usize>) {
        None => None,
        Some(Ok(step)) if step > 0 => Some(step),
        Some(_) => return item.to_string(),
    };

    let start = start % 7;
    if start <= end && end < 7 && step.is_none() {
        return format!("{}-{}", DAY_NAMES[start], DAY_NAMES[end]);
    }

    let span = if end >= start { end - start } else { end + 7 - start };
    let mut days: Vec<&str> = Vec::new();
    for offset in (0..=span).step_by(step.unwrap_or(1)) {
        let name = DAY_NAMES[(start + offset) % 7];
        if !days.contains(&name) {
            days.push(name);
        }
    }
    days.join(",")
}

/// Crontab day number `0`-`7`; `7` is Sunday like `0`
fn crontab_day(value: &str) -> Option<usize> {
    match value.parse::<usize>() {
        Ok(day) if day <= 7 => Some(day),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_six_field_daily() {
        let spec = CronSpec::parse("0 0 3 * * *", "UTC").expect("valid");
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let next = spec.next_after(now).expect("next");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 11, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_five_field_gets_seconds() {
        let spec = CronSpec::parse("*/15 * * * *", "UTC").expect("valid");
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 1, 30).unwrap();
        let next = spec.next_after(now).expect("next");
        assert_eq!((next.minute(), next.second()), (15, 0));
    }

    #[test]
    fn test_five_field_weekdays_keep_crontab_meaning() {
        assert_eq!(crontab_day_of_week("1-5"), "MON-FRI");
        assert_eq!(crontab_day_of_week("0,6"), "SUN,SAT");
        assert_eq!(crontab_day_of_week("*"), "*");

        let spec = CronSpec::parse("0 9 * * 1-5", "UTC").expect("valid");
        // Saturday
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let next = spec.next_after(now).expect("next");
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn test_five_field_weekday_ranges_that_wrap() {
        assert_eq!(crontab_day_of_week("5-7"), "FRI,SAT,SUN");
        assert_eq!(crontab_day_of_week("6-0"), "SAT,SUN");
        assert_eq!(crontab_day_of_week("7"), "SUN");
        assert_eq!(crontab_day_of_week("0-6/2"), "SUN,TUE,THU,SAT");
        assert_eq!(crontab_day_of_week("1-5"), "MON-FRI");

        let spec = CronSpec::parse("0 9 * * 5-7", "UTC").expect("wrapping range parses");
        // Monday
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();
        let next = spec.next_after(now).expect("next");
        assert_eq!(next.weekday(), Weekday::Fri);

        // Saturday after 09:00; Sunday is still in range
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let next = spec.next_after(now).expect("next");
        assert_eq!(next.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_timezone_applied() {
        let spec = CronSpec::parse("0 0 3 * * *", "America/New_York").expect("valid");
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let next = spec.next_after(now).expect("next");
        // 03:00 EST is 08:00 UTC
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            CronSpec::parse("every day", "UTC"),
            Err(CronError::InvalidExpression { .. })
        ));
        assert!(matches!(
            CronSpec::parse("0 0 3 * * *", "Mars/Olympus"),
            Err(CronError::InvalidTimezone(_))
        ));
        assert!(CronSpec::parse("0 99 * * *", "UTC").is_err());
    }

    #[test]
    fn test_duration_until_next() {
        let spec = CronSpec::parse("0 0 * * * *", "UTC").expect("valid");
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 59, 0).unwrap();
        let (next, wait) = spec.duration_until_next(now).expect("next");
        assert_eq!(next.hour(), 13);
        assert_eq!(wait, Duration::from_secs(60));
    }
}
