// dbguardian/src/scheduler/cron.rs
//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Supports `*`, lists, ranges, steps and three-letter month/day names. Day-of-week
//! accepts both `0` and `7` for Sunday. When day-of-month and day-of-week are both
//! restricted a day matches if either does. All evaluation is in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How far ahead `next_after` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366 * 28;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {0}")]
    FieldCount(usize),

    #[error("invalid value '{value}' in {field} field")]
    InvalidValue { field: &'static str, value: String },

    #[error("value {value} out of range {min}-{max} in {field} field")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("step must be greater than zero in {field} field")]
    ZeroStep { field: &'static str },
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names mapped onto `min..`.
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: DAY_NAMES };

/// The set of values one field matches, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronField {
    bits: u64,
    /// False for fields written as `*` or `*/n`.
    restricted: bool,
}

impl CronField {
    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    fn parse(text: &str, spec: FieldSpec) -> Result<Self, CronParseError> {
        let mut bits = 0u64;
        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid(spec, part))?;
                    if step == 0 {
                        return Err(CronParseError::ZeroStep { field: spec.name });
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" {
                (spec.min, spec.max)
            } else if let Some((lo, hi)) = range.split_once('-') {
                (value(lo, spec)?, value(hi, spec)?)
            } else {
                let single = value(range, spec)?;
                // `5/15` means from 5 to the end of the range
                (single, if step.is_some() { spec.max } else { single })
            };
            if start > end {
                return Err(invalid(spec, part));
            }

            let step = step.unwrap_or(1) as usize;
            for v in (start..=end).step_by(step) {
                bits |= 1u64 << v;
            }
        }

        if spec.name == DAY_OF_WEEK.name && bits & (1u64 << 7) != 0 {
            bits = (bits & !(1u64 << 7)) | 1;
        }
        Ok(CronField {
            bits,
            restricted: !text.starts_with('*'),
        })
    }
}

fn invalid(spec: FieldSpec, text: &str) -> CronParseError {
    CronParseError::InvalidValue {
        field: spec.name,
        value: text.to_string(),
    }
}

fn value(text: &str, spec: FieldSpec) -> Result<u32, CronParseError> {
    let lower = text.to_ascii_lowercase();
    if let Some(index) = spec.names.iter().position(|n| *n == lower) {
        return Ok(spec.min + index as u32);
    }
    let v: u32 = text.parse().map_err(|_| invalid(spec, text))?;
    if v < spec.min || v > spec.max {
        return Err(CronParseError::OutOfRange {
            field: spec.name,
            value: v,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(v)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }
        Ok(CronExpr {
            source: fields.join(" "),
            minute: CronField::parse(fields[0], MINUTE)?,
            hour: CronField::parse(fields[1], HOUR)?,
            day_of_month: CronField::parse(fields[2], DAY_OF_MONTH)?,
            month: CronField::parse(fields[3], MONTH)?,
            day_of_week: CronField::parse(fields[4], DAY_OF_WEEK)?,
        })
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl CronExpr {
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self.day_of_week.contains(date.weekday().num_days_from_sunday());
        if self.day_of_month.is_restricted() && self.day_of_week.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First matching minute strictly after `after`, or `None` if the expression
    /// cannot fire (for example `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);

        let mut t = start;
        while t <= horizon {
            if !self.month.contains(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_day(t.date_naive().succ_opt()?)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
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

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    start_of_day(NaiveDate::from_ymd_opt(year, month, 1)?)
}
