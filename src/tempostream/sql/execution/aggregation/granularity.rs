//! The granularity ladder: ordered time bucketing levels and their window
//! arithmetic.
//!
//! Seconds through days are fixed-width windows on the epoch-millisecond
//! axis; months and years are calendar-aware (UTC) and computed via chrono.

use crate::tempostream::sql::error::SqlError;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const SECOND_MILLIS: i64 = 1_000;
const MINUTE_MILLIS: i64 = 60 * SECOND_MILLIS;
const HOUR_MILLIS: i64 = 60 * MINUTE_MILLIS;
const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

/// One level of time bucketing, totally ordered finest to coarsest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TimeGranularity {
    Seconds,
    Minutes,
    Hours,
    Days,
    Months,
    Years,
}

impl TimeGranularity {
    /// Every granularity, finest first
    pub const ALL: [TimeGranularity; 6] = [
        TimeGranularity::Seconds,
        TimeGranularity::Minutes,
        TimeGranularity::Hours,
        TimeGranularity::Days,
        TimeGranularity::Months,
        TimeGranularity::Years,
    ];

    /// Canonical name used by `per` selectors and table naming
    pub fn canonical_name(&self) -> &'static str {
        match self {
            TimeGranularity::Seconds => "SECONDS",
            TimeGranularity::Minutes => "MINUTES",
            TimeGranularity::Hours => "HOURS",
            TimeGranularity::Days => "DAYS",
            TimeGranularity::Months => "MONTHS",
            TimeGranularity::Years => "YEARS",
        }
    }

    /// Start of the window containing `timestamp` (epoch millis).
    ///
    /// Out-of-range timestamps chrono cannot represent floor to themselves.
    pub fn window_start(&self, timestamp: i64) -> i64 {
        match self {
            TimeGranularity::Seconds => floor_to(timestamp, SECOND_MILLIS),
            TimeGranularity::Minutes => floor_to(timestamp, MINUTE_MILLIS),
            TimeGranularity::Hours => floor_to(timestamp, HOUR_MILLIS),
            TimeGranularity::Days => floor_to(timestamp, DAY_MILLIS),
            TimeGranularity::Months => match utc_datetime(timestamp) {
                Some(dt) => utc_millis(dt.year(), dt.month(), 1).unwrap_or(timestamp),
                None => timestamp,
            },
            TimeGranularity::Years => match utc_datetime(timestamp) {
                Some(dt) => utc_millis(dt.year(), 1, 1).unwrap_or(timestamp),
                None => timestamp,
            },
        }
    }

    /// Start of the window after the one containing `timestamp`: the emit
    /// boundary of the open window.
    pub fn next_emit_time(&self, timestamp: i64) -> i64 {
        match self {
            TimeGranularity::Seconds => self.window_start(timestamp) + SECOND_MILLIS,
            TimeGranularity::Minutes => self.window_start(timestamp) + MINUTE_MILLIS,
            TimeGranularity::Hours => self.window_start(timestamp) + HOUR_MILLIS,
            TimeGranularity::Days => self.window_start(timestamp) + DAY_MILLIS,
            TimeGranularity::Months => match utc_datetime(timestamp) {
                Some(dt) => {
                    let (year, month) = if dt.month() == 12 {
                        (dt.year() + 1, 1)
                    } else {
                        (dt.year(), dt.month() + 1)
                    };
                    utc_millis(year, month, 1).unwrap_or(timestamp)
                }
                None => timestamp,
            },
            TimeGranularity::Years => match utc_datetime(timestamp) {
                Some(dt) => utc_millis(dt.year() + 1, 1, 1).unwrap_or(timestamp),
                None => timestamp,
            },
        }
    }

    /// End of the window starting at `window_start` (exclusive)
    pub fn window_end(&self, window_start: i64) -> i64 {
        self.next_emit_time(window_start)
    }
}

impl fmt::Display for TimeGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_name())
    }
}

fn floor_to(timestamp: i64, width: i64) -> i64 {
    timestamp - timestamp.rem_euclid(width)
}

fn utc_datetime(timestamp: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(timestamp)
}

fn utc_millis(year: i32, month: u32, day: u32) -> Option<i64> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
}

/// Resolve a `per` duration string to its granularity.
///
/// Accepts the canonical plural names plus the common singular and short
/// forms, case-insensitively. Unrecognized strings are a parse error listing
/// the valid names, so the failure is deterministic for a given input.
pub fn normalize_duration(value: &str) -> Result<TimeGranularity, SqlError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "sec" | "second" | "seconds" => Ok(TimeGranularity::Seconds),
        "min" | "minute" | "minutes" => Ok(TimeGranularity::Minutes),
        "hour" | "hours" => Ok(TimeGranularity::Hours),
        "day" | "days" => Ok(TimeGranularity::Days),
        "month" | "months" => Ok(TimeGranularity::Months),
        "year" | "years" => Ok(TimeGranularity::Years),
        _ => Err(SqlError::parse_error(
            format!(
                "per value '{}' is not a valid time granularity; expected one of \
                 SECONDS, MINUTES, HOURS, DAYS, MONTHS, YEARS",
                value
            ),
            None,
        )),
    }
}

/// Normalize a `within` range: the end defaults to the evaluation instant
/// when only a start is given. The range must be non-empty.
pub fn start_time_end_time(
    start: i64,
    end: Option<i64>,
    now: i64,
) -> Result<(i64, i64), SqlError> {
    let end = end.unwrap_or(now);
    if end <= start {
        return Err(SqlError::execution_error(
            format!(
                "within range is empty: start {} is not before end {}",
                start, end
            ),
            None,
        ));
    }
    Ok((start, end))
}
