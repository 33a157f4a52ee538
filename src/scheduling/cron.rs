//! Cron expression parsing and evaluation.
//!
//! Supports standard 5-field cron expressions:
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31)
//! │ │ │ ┌───────────── month (1-12 or JAN-DEC)
//! │ │ │ │ ┌───────────── day of week (0-7 or SUN-SAT, 0 and 7 = Sunday)
//! │ │ │ │ │
//! * * * * *
//! ```
//!
//! plus the `@hourly`, `@daily`, `@weekly`, `@monthly` and `@yearly` macros.
//! When both day fields are restricted a time matches if either one does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing cron expressions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("unknown macro '{0}'")]
    UnknownMacro(String),
    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid range {0}-{1}")]
    InvalidRange(u32, u32),
    #[error("invalid step '{0}'")]
    InvalidStep(String),
}

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Static description of one cron field.
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Symbolic names, the first mapping to `min`.
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES };
// 7 is accepted and folded onto Sunday after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &WEEKDAY_NAMES };

/// The set of values one field of an expression matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    values: BTreeSet<u32>,
    /// Whether the field was written as a bare `*`.
    wildcard: bool,
}

impl CronField {
    fn parse(spec: &FieldSpec, expr: &str) -> Result<Self, CronParseError> {
        let mut values = BTreeSet::new();
        for part in expr.split(',') {
            Self::parse_part(spec, part.trim(), &mut values)?;
        }
        Ok(Self {
            values,
            wildcard: expr == "*",
        })
    }

    fn parse_value(spec: &FieldSpec, raw: &str) -> Result<u32, CronParseError> {
        if let Some(pos) = spec
            .names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(raw))
        {
            return Ok(spec.min + pos as u32);
        }
        let value = raw.parse::<u32>().map_err(|_| CronParseError::InvalidValue {
            field: spec.name,
            value: raw.to_string(),
        })?;
        if value < spec.min || value > spec.max {
            return Err(CronParseError::OutOfRange {
                field: spec.name,
                value,
                min: spec.min,
                max: spec.max,
            });
        }
        Ok(value)
    }

    fn parse_part(
        spec: &FieldSpec,
        part: &str,
        values: &mut BTreeSet<u32>,
    ) -> Result<(), CronParseError> {
        // Step values (e.g. */5, 0-30/5, 10/15)
        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step = step_str
                    .parse::<u32>()
                    .map_err(|_| CronParseError::InvalidStep(step_str.to_string()))?;
                if step == 0 {
                    return Err(CronParseError::InvalidStep(step_str.to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range_part == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let start = Self::parse_value(spec, lo)?;
            let end = Self::parse_value(spec, hi)?;
            if start > end {
                return Err(CronParseError::InvalidRange(start, end));
            }
            (start, end)
        } else {
            let value = Self::parse_value(spec, range_part)?;
            // "10/15" means starting at 10 through the end of the range
            match step {
                Some(_) => (value, spec.max),
                None => (value, value),
            }
        };

        let step = step.unwrap_or(1) as usize;
        values.extend((start..=end).step_by(step));
        Ok(())
    }

    /// Check if a value matches this field.
    pub fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// The smallest matching value >= `value`.
    fn next(&self, value: u32) -> Option<u32> {
        self.values.range(value..).next().copied()
    }

    fn first(&self) -> u32 {
        self.values.iter().next().copied().unwrap_or_default()
    }

    /// Number of values this field matches.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    expr: String,
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    /// Normalized so that Sunday is always 0.
    pub day_of_week: CronField,
}

impl CronExpr {
    /// Parse a cron expression string.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let trimmed = expr.trim();
        let expanded = if trimmed.starts_with('@') {
            match trimmed.to_ascii_lowercase().as_str() {
                "@hourly" => "0 * * * *",
                "@daily" | "@midnight" => "0 0 * * *",
                "@weekly" => "0 0 * * 0",
                "@monthly" => "0 0 1 * *",
                "@yearly" | "@annually" => "0 0 1 1 *",
                _ => return Err(CronParseError::UnknownMacro(trimmed.to_string())),
            }
        } else {
            trimmed
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::InvalidFieldCount(parts.len()));
        }

        let mut day_of_week = CronField::parse(&DAY_OF_WEEK, parts[4])?;
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }

        Ok(Self {
            expr: trimmed.to_string(),
            minute: CronField::parse(&MINUTE, parts[0])?,
            hour: CronField::parse(&HOUR, parts[1])?,
            day_of_month: CronField::parse(&DAY_OF_MONTH, parts[2])?,
            month: CronField::parse(&MONTH, parts[3])?,
            day_of_week,
        })
    }

    /// The expression as written.
    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Check if a date matches the day fields.
    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());
        match (self.day_of_month.wildcard, self.day_of_week.wildcard) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    /// Check if a datetime matches this cron expression.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.month.matches(dt.month())
            && self.matches_day(dt.date_naive())
    }

    /// Calculate the first matching time strictly after `after`.
    ///
    /// Returns `None` if nothing matches within the next five years (e.g. `0 0 31 2 *`).
    pub fn next_run(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_second(0)
            .and_then(|dt| dt.with_nanosecond(0))?
            + Duration::minutes(1);
        let limit = start.date_naive() + Duration::days(5 * 366);

        let mut date = start.date_naive();
        let mut first_day = true;
        while date <= limit {
            if !self.month.matches(date.month()) {
                // Jump to the first day of the next matching month
                date = match self.month.next(date.month() + 1) {
                    Some(m) => NaiveDate::from_ymd_opt(date.year(), m, 1)?,
                    None => NaiveDate::from_ymd_opt(date.year() + 1, self.month.first(), 1)?,
                };
                first_day = false;
                continue;
            }
            if self.matches_day(date) {
                let (from_hour, from_minute) = if first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                if let Some(time) = self.first_time_from(from_hour, from_minute) {
                    return Some(date.and_time(time).and_utc());
                }
            }
            date = date.succ_opt()?;
            first_day = false;
        }

        None
    }

    /// The earliest matching time of day at or after `hour:minute`.
    fn first_time_from(&self, hour: u32, minute: u32) -> Option<NaiveTime> {
        let mut h = self.hour.next(hour)?;
        let m = if h == hour {
            match self.minute.next(minute) {
                Some(m) => m,
                None => {
                    h = self.hour.next(hour + 1)?;
                    self.minute.first()
                }
            }
        } else {
            self.minute.first()
        };
        NaiveTime::from_hms_opt(h, m, 0)
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_wildcard() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        assert_eq!(expr.minute.len(), 60);
        assert_eq!(expr.hour.len(), 24);
        assert_eq!(expr.day_of_week.len(), 7);
    }

    #[test]
    fn test_parse_step_and_list() {
        let expr = CronExpr::parse("*/15 0,12 * * *").unwrap();
        assert_eq!(expr.minute.len(), 4);
        assert!(expr.minute.matches(45));
        assert!(expr.hour.matches(12));
        assert!(!expr.hour.matches(6));

        let offset = CronExpr::parse("10/20 * * * *").unwrap();
        assert!(offset.minute.matches(10));
        assert!(offset.minute.matches(30));
        assert!(offset.minute.matches(50));
        assert_eq!(offset.minute.len(), 3);
    }

    #[test]
    fn test_parse_names_and_sunday_alias() {
        let expr = CronExpr::parse("0 9 * JAN-MAR mon-fri").unwrap();
        assert!(expr.month.matches(2));
        assert!(!expr.month.matches(4));
        assert!(expr.day_of_week.matches(1));
        assert!(!expr.day_of_week.matches(0));

        let sunday = CronExpr::parse("0 0 * * 7").unwrap();
        assert!(sunday.day_of_week.matches(0));
    }

    #[test]
    fn test_macros() {
        assert_eq!(
            CronExpr::parse("@daily").unwrap().next_run(&at(2024, 1, 15, 14, 30)),
            Some(at(2024, 1, 16, 0, 0))
        );
        assert!(matches!(
            CronExpr::parse("@fortnightly"),
            Err(CronParseError::UnknownMacro(_))
        ));
    }

    #[test]
    fn test_next_run_hourly() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        let next = expr.next_run(&at(2024, 1, 15, 14, 30)).unwrap();
        assert_eq!(next, at(2024, 1, 15, 15, 0));
    }

    #[test]
    fn test_next_run_is_strictly_after() {
        let expr = CronExpr::parse("30 4 * * *").unwrap();
        let now = at(2024, 1, 15, 4, 30);
        assert!(expr.matches(&now));
        assert_eq!(expr.next_run(&now), Some(at(2024, 1, 16, 4, 30)));
    }

    #[test]
    fn test_next_run_rolls_hour() {
        let expr = CronExpr::parse("15 */2 * * *").unwrap();
        let next = expr.next_run(&at(2024, 1, 15, 14, 20)).unwrap();
        assert_eq!(next, at(2024, 1, 15, 16, 15));
    }

    #[test]
    fn test_next_run_yearly_rolls_year() {
        let expr = CronExpr::parse("0 0 1 1 *").unwrap();
        let next = expr.next_run(&at(2024, 1, 15, 14, 30)).unwrap();
        assert_eq!(next, at(2025, 1, 1, 0, 0));
    }

    #[test]
    fn test_day_fields_use_or_semantics() {
        // The 13th of the month or any Friday
        let expr = CronExpr::parse("0 0 13 * 5").unwrap();
        // 2024-01-19 is a Friday
        assert!(expr.matches(&at(2024, 1, 19, 0, 0)));
        // 2024-02-13 is a Tuesday
        assert!(expr.matches(&at(2024, 2, 13, 0, 0)));
        assert!(!expr.matches(&at(2024, 2, 14, 0, 0)));
    }

    #[test]
    fn test_impossible_date_has_no_next_run() {
        let expr = CronExpr::parse("0 0 31 2 *").unwrap();
        assert_eq!(expr.next_run(&at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_invalid_expressions() {
        assert_eq!(
            CronExpr::parse("* *"),
            Err(CronParseError::InvalidFieldCount(2))
        );
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 25 * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
        assert!(CronExpr::parse("* * * FOO *").is_err());
    }
}
