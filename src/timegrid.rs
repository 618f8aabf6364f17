/// Calendar helpers: interval maps, timestamp parsing, grid rounding and
/// regular grid construction.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::model::Timestamp;

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// A calendar interval written as a map of units, e.g. `{ hours = 1 }` or
/// `{"days": 1, "hours": 9}`. Units add up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Interval {
    #[serde(default, alias = "millisecond", skip_serializing_if = "is_zero")]
    pub milliseconds: i64,
    #[serde(default, alias = "second", skip_serializing_if = "is_zero")]
    pub seconds: i64,
    #[serde(default, alias = "minute", skip_serializing_if = "is_zero")]
    pub minutes: i64,
    #[serde(default, alias = "hour", skip_serializing_if = "is_zero")]
    pub hours: i64,
    #[serde(default, alias = "day", skip_serializing_if = "is_zero")]
    pub days: i64,
    #[serde(default, alias = "week", skip_serializing_if = "is_zero")]
    pub weeks: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Interval {
    pub fn minutes(n: i64) -> Self {
        Interval {
            minutes: n,
            ..Interval::default()
        }
    }

    pub fn hours(n: i64) -> Self {
        Interval {
            hours: n,
            ..Interval::default()
        }
    }

    pub fn days(n: i64) -> Self {
        Interval {
            days: n,
            ..Interval::default()
        }
    }

    pub fn to_duration(&self) -> Duration {
        Duration::milliseconds(self.milliseconds)
            + Duration::seconds(self.seconds)
            + Duration::minutes(self.minutes)
            + Duration::hours(self.hours)
            + Duration::days(self.days)
            + Duration::weeks(self.weeks)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parses a UTC offset such as `-03:00`, `+0530` or `Z`.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset, String> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| "invalid offset".to_string());
    }

    let (sign, rest) = match trimmed.chars().next() {
        Some('+') => (1, &trimmed[1..]),
        Some('-') => (-1, &trimmed[1..]),
        _ => return Err(format!("UTC offset '{}' must start with + or -", raw)),
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("UTC offset '{}' must look like +HH:MM", raw));
    }

    let hours: i32 = digits[0..2].parse().map_err(|e| format!("{}", e))?;
    let minutes: i32 = digits[2..4].parse().map_err(|e| format!("{}", e))?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("UTC offset '{}' out of range", raw))
}

/// Parses an ISO-8601 timestamp into `zone`.
///
/// Strings carrying an offset are converted into the zone; naive strings
/// (and bare dates, taken at midnight) are interpreted as local time in it.
pub fn parse_timestamp(raw: &str, zone: FixedOffset) -> Result<Timestamp, String> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&zone));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, format) {
            return Ok(dt.with_timezone(&zone));
        }
    }

    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| format!("unrecognised timestamp '{}'", raw))?;

    zone.from_local_datetime(&naive)
        .single()
        .ok_or_else(|| format!("timestamp '{}' does not exist in zone {}", raw, zone))
}

/// ISO-8601 rendering used on the wire and in reports.
pub fn format_timestamp(timestamp: &Timestamp) -> String {
    timestamp.to_rfc3339()
}

// ---------------------------------------------------------------------------
// Rounding and normalisation
// ---------------------------------------------------------------------------

/// Truncates to midnight (local time) and adds `offset`.
pub fn normalize_day(timestamp: &Timestamp, offset: Duration) -> Timestamp {
    let midnight = timestamp
        .with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(*timestamp);
    midnight + offset
}

/// Rounds `timestamp` down to the resolution of `interval`.
///
/// Sub-second parts are always dropped for intervals without a sub-second
/// component; seconds are dropped when the interval is a whole number of
/// minutes, minutes when it is a whole number of hours. Whole-day intervals
/// snap to midnight and then apply `day_offset`.
pub fn round_down(timestamp: &Timestamp, interval: Duration, day_offset: Option<Duration>) -> Timestamp {
    let total_seconds = interval.num_seconds();
    let day_seconds = total_seconds.rem_euclid(86_400);
    let days = total_seconds.div_euclid(86_400);
    let sub_second = interval - Duration::seconds(total_seconds);

    let mut rounded = *timestamp;
    if sub_second.is_zero() {
        rounded = rounded.with_nanosecond(0).unwrap_or(rounded);
    }
    if day_seconds % 60 == 0 {
        rounded = rounded.with_second(0).unwrap_or(rounded);
    }
    if day_seconds % 3600 == 0 {
        rounded = rounded.with_minute(0).unwrap_or(rounded);
    }
    if day_seconds == 0 && days >= 1 {
        rounded = rounded.with_hour(0).unwrap_or(rounded);
        if let Some(offset) = day_offset {
            rounded += offset;
        }
    }
    rounded
}

// ---------------------------------------------------------------------------
// TimeGrid
// ---------------------------------------------------------------------------

/// A regular sequence of timestamps from `start` to `end` inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeGrid {
    pub start: Timestamp,
    pub end: Timestamp,
    pub interval: Duration,
    timestamps: Vec<Timestamp>,
}

impl TimeGrid {
    /// Builds the grid. `start` is rounded down to the interval (with
    /// `day_offset` applied for daily intervals). A non-positive interval
    /// yields an empty grid.
    pub fn new(start: Timestamp, end: Timestamp, interval: Duration, day_offset: Option<Duration>) -> Self {
        let first = round_down(&start, interval, day_offset);
        let mut timestamps = Vec::new();
        if interval > Duration::zero() {
            let mut current = first;
            while current <= end {
                timestamps.push(current);
                current += interval;
            }
        }
        TimeGrid {
            start: first,
            end,
            interval,
            timestamps,
        }
    }

    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Number of whole grid steps covered by `limit`.
pub fn steps_in(limit: Duration, interval: Duration) -> usize {
    let interval_ms = interval.num_milliseconds();
    if interval_ms <= 0 {
        return 0;
    }
    (limit.num_milliseconds() / interval_ms).max(0) as usize
}
