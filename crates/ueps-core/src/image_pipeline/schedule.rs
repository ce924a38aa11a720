//! Cron schedules evaluated in UTC at minute granularity.
//!
//! Two forms are accepted:
//! - standard 5-field cron: `min hour day-of-month month day-of-week`
//!   (day-of-week 0-7, 0 and 7 are Sunday)
//! - the AWS form `cron(min hour day-of-month month day-of-week year)` where
//!   `?` is a wildcard and day-of-week runs 1-7 starting on Sunday
//!
//! Fields take `*`, lists `a,b`, ranges `a-b`, steps `*/n` and `a-b/n`, and
//! month / weekday names (`JAN`, `MON`).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, UepsError};

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// How far `next_after` searches before giving up on a schedule that never
/// fires (e.g. February 30th).
const SEARCH_YEARS: i64 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    /// `*` or `?`: every value matches.
    any: bool,
    /// Written starting with `*` or `?`, including steps such as `*/2`.
    starred: bool,
    values: BTreeSet<u32>,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.any || self.values.contains(&value)
    }
}

/// Parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    expression: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    /// Sunday = 0.
    day_of_week: Field,
    year: Field,
}

struct FieldSpec {
    label: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first name (`JAN` = 1, `SUN` = 0 or 1).
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec::numeric("minute", 0, 59);
const HOUR: FieldSpec = FieldSpec::numeric("hour", 0, 23);
const DAY_OF_MONTH: FieldSpec = FieldSpec::numeric("day-of-month", 1, 31);
const YEAR: FieldSpec = FieldSpec::numeric("year", 1970, 2199);
const MONTH: FieldSpec = FieldSpec {
    label: "month",
    min: 1,
    max: 12,
    names: &MONTHS,
    name_base: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    label: "day-of-week",
    min: 0,
    max: 7,
    names: &WEEKDAYS,
    name_base: 0,
};
const AWS_DAY_OF_WEEK: FieldSpec = FieldSpec {
    label: "day-of-week",
    min: 1,
    max: 7,
    names: &WEEKDAYS,
    name_base: 1,
};

impl FieldSpec {
    const fn numeric(label: &'static str, min: u32, max: u32) -> Self {
        Self {
            label,
            min,
            max,
            names: &[],
            name_base: 0,
        }
    }
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let invalid = |reason: String| UepsError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let (aws, body) = match trimmed
            .strip_prefix("cron(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            Some(inner) => (true, inner),
            None => (false, trimmed),
        };

        let parts: Vec<&str> = body.split_whitespace().collect();
        let expected = if aws { 6 } else { 5 };
        if parts.len() != expected {
            return Err(invalid(format!(
                "expected {expected} fields, found {}",
                parts.len()
            )));
        }

        let field = |text: &str, spec: &FieldSpec| parse_field(text, spec).map_err(&invalid);

        let minute = field(parts[0], &MINUTE)?;
        let hour = field(parts[1], &HOUR)?;
        let day_of_month = field(parts[2], &DAY_OF_MONTH)?;
        let month = field(parts[3], &MONTH)?;

        let day_of_week = if aws {
            let raw = field(parts[4], &AWS_DAY_OF_WEEK)?;
            Field {
                values: raw.values.iter().map(|d| d - 1).collect(),
                ..raw
            }
        } else {
            let raw = field(parts[4], &DAY_OF_WEEK)?;
            Field {
                values: raw.values.iter().map(|d| d % 7).collect(),
                ..raw
            }
        };

        let year = if aws {
            field(parts[5], &YEAR)?
        } else {
            Field {
                any: true,
                starred: true,
                values: BTreeSet::new(),
            }
        };

        if aws && !day_of_month.any && !day_of_week.any {
            return Err(invalid(
                "one of day-of-month or day-of-week must be '?'".to_string(),
            ));
        }

        Ok(Self {
            expression: trimmed.to_string(),
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
            year,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());
        // Either may match only when both day fields are explicit lists or
        // ranges; a starred field (`*`, `?`, `*/n`) makes both required.
        if self.day_of_month.starred || self.day_of_week.starred {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Whether the schedule fires in the minute containing `at`.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.year.contains(at.year() as u32)
            && self.month.contains(at.month())
            && self.day_matches(at.date_naive())
            && self.hour.contains(at.hour())
            && self.minute.contains(at.minute())
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after + Duration::days(366 * SEARCH_YEARS);
        let mut t = floor_minute(after)? + Duration::minutes(1);

        while t <= limit {
            if !self.year.contains(t.year() as u32) {
                t = ymd(t.year() + 1, 1, 1)?;
                continue;
            }
            if !self.month.contains(t.month()) {
                t = if t.month() == 12 {
                    ymd(t.year() + 1, 1, 1)?
                } else {
                    ymd(t.year(), t.month() + 1, 1)?
                };
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                let next = t.date_naive().succ_opt()?;
                t = ymd(next.year(), next.month(), next.day())?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = floor_hour(t)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn ymd(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).single()
}

fn floor_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
        .single()
}

fn floor_hour(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
        .single()
}

fn parse_value(text: &str, spec: &FieldSpec) -> std::result::Result<u32, String> {
    if let Ok(n) = text.parse::<u32>() {
        if n < spec.min || n > spec.max {
            return Err(format!(
                "{} value {n} outside {}-{}",
                spec.label, spec.min, spec.max
            ));
        }
        return Ok(n);
    }
    let upper = text.to_ascii_uppercase();
    spec.names
        .iter()
        .position(|name| *name == upper)
        .map(|idx| idx as u32 + spec.name_base)
        .ok_or_else(|| format!("invalid {} value {text:?}", spec.label))
}

fn parse_field(text: &str, spec: &FieldSpec) -> std::result::Result<Field, String> {
    if text == "*" || text == "?" {
        return Ok(Field {
            any: true,
            starred: true,
            values: BTreeSet::new(),
        });
    }
    let starred = text.starts_with('*') || text.starts_with('?');

    let mut values = BTreeSet::new();
    for item in text.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid {} step {step:?}", spec.label))?;
                if step == 0 {
                    return Err(format!("{} step must be positive", spec.label));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let start = parse_value(range, spec)?;
            // `a/n` runs from a to the end of the range.
            (start, if step.is_some() { spec.max } else { start })
        };

        if start > end {
            return Err(format!("{} range {start}-{end} is reversed", spec.label));
        }
        values.extend((start..=end).step_by(step.unwrap_or(1) as usize));
    }

    Ok(Field {
        any: false,
        starred,
        values,
    })
}

impl FromStr for Schedule {
    type Err = UepsError;

    fn from_str(s: &str) -> Result<Self> {
        Schedule::parse(s)
    }
}

impl TryFrom<String> for Schedule {
    type Error = UepsError;

    fn try_from(value: String) -> Result<Self> {
        Schedule::parse(&value)
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> String {
        schedule.expression
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_standard_cron_matches() {
        // 09:00 every Monday. 2024-01-01 was a Monday.
        let s = Schedule::parse("0 9 * * 1").unwrap();
        assert!(s.matches(at(2024, 1, 1, 9, 0)));
        assert!(s.matches(at(2024, 1, 1, 9, 0) + Duration::seconds(42)));
        assert!(!s.matches(at(2024, 1, 1, 9, 1)));
        assert!(!s.matches(at(2024, 1, 2, 9, 0)));
    }

    #[test]
    fn test_aws_cron_form() {
        // AWS day-of-week 2 = Monday.
        let s = Schedule::parse("cron(0 9 ? * 2 *)").unwrap();
        assert!(s.matches(at(2024, 1, 1, 9, 0)));
        assert!(!s.matches(at(2024, 1, 7, 9, 0)));

        let named = Schedule::parse("cron(0 9 ? * MON *)").unwrap();
        assert!(named.matches(at(2024, 1, 8, 9, 0)));
    }

    #[test]
    fn test_aws_form_requires_question_mark() {
        let err = Schedule::parse("cron(0 9 1 * MON *)").unwrap_err();
        assert!(matches!(err, UepsError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_steps_ranges_lists() {
        let s = Schedule::parse("*/15 8-10 1,15 JAN-MAR *").unwrap();
        assert!(s.matches(at(2024, 2, 15, 10, 45)));
        assert!(!s.matches(at(2024, 2, 15, 11, 0)));
        assert!(!s.matches(at(2024, 4, 1, 8, 0)));
        assert!(!s.matches(at(2024, 1, 2, 8, 0)));
        assert!(!s.matches(at(2024, 1, 1, 8, 10)));
    }

    #[test]
    fn test_day_fields_or_only_when_both_restricted() {
        // 2024-01-01 and 2024-01-08 were Mondays, 2024-02-15 a Thursday.
        let either = Schedule::parse("0 9 1,15 * MON").unwrap();
        assert!(either.matches(at(2024, 2, 15, 9, 0)));
        assert!(either.matches(at(2024, 1, 8, 9, 0)));
        assert!(!either.matches(at(2024, 1, 9, 9, 0)));

        // A stepped wildcard still counts as unrestricted: both must match.
        let both = Schedule::parse("0 9 */2 * MON").unwrap();
        assert!(both.matches(at(2024, 1, 1, 9, 0)));
        assert!(!both.matches(at(2024, 1, 8, 9, 0)));
        assert!(!both.matches(at(2024, 1, 3, 9, 0)));
    }

    #[test]
    fn test_sunday_as_seven() {
        // 2024-01-07 was a Sunday.
        let s = Schedule::parse("0 0 * * 7").unwrap();
        assert!(s.matches(at(2024, 1, 7, 0, 0)));
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in ["", "* * * *", "60 * * * *", "* 24 * * *", "*/0 * * * *", "5-1 * * * *", "* * * FOO *"] {
            assert!(Schedule::parse(expr).is_err(), "{expr:?} should be rejected");
        }
    }

    #[test]
    fn test_next_after() {
        let s = Schedule::parse("30 9 * * *").unwrap();
        assert_eq!(s.next_after(at(2024, 1, 1, 8, 0)), Some(at(2024, 1, 1, 9, 30)));
        // strictly after
        assert_eq!(s.next_after(at(2024, 1, 1, 9, 30)), Some(at(2024, 1, 2, 9, 30)));
        // crosses a year boundary
        assert_eq!(s.next_after(at(2024, 12, 31, 23, 0)), Some(at(2025, 1, 1, 9, 30)));
    }

    #[test]
    fn test_next_after_leap_day() {
        let s = Schedule::parse("0 0 29 2 *").unwrap();
        assert_eq!(s.next_after(at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 0, 0)));
    }

    #[test]
    fn test_next_after_never() {
        let s = Schedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(s.next_after(at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_serde_as_expression() {
        let s: Schedule = serde_json::from_str("\"cron(0 9 ? * MON *)\"").unwrap();
        assert_eq!(s.expression(), "cron(0 9 ? * MON *)");
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"cron(0 9 ? * MON *)\"");
    }
}
