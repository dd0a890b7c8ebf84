//! Instant normalization for event bounds.
//!
//! Event start/stop may be given as chrono values, ISO-8601 strings or epoch
//! seconds. Everything is normalized to a UTC instant truncated to
//! microseconds.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::DbError;

/// Canonical instant representation.
pub type Timestamp = DateTime<Utc>;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Conversion into a canonical [`Timestamp`].
pub trait IntoTimestamp {
    fn into_timestamp(self) -> Result<Timestamp, DbError>;
}

impl IntoTimestamp for Timestamp {
    fn into_timestamp(self) -> Result<Timestamp, DbError> {
        Ok(truncate_to_micros(self))
    }
}

impl IntoTimestamp for NaiveDateTime {
    fn into_timestamp(self) -> Result<Timestamp, DbError> {
        Ok(truncate_to_micros(Utc.from_utc_datetime(&self)))
    }
}

impl IntoTimestamp for NaiveDate {
    fn into_timestamp(self) -> Result<Timestamp, DbError> {
        self.and_hms_opt(0, 0, 0)
            .ok_or_else(|| DbError::InvalidTimestamp(self.to_string()))?
            .into_timestamp()
    }
}

impl IntoTimestamp for i64 {
    fn into_timestamp(self) -> Result<Timestamp, DbError> {
        DateTime::from_timestamp(self, 0).ok_or_else(|| DbError::InvalidTimestamp(self.to_string()))
    }
}

impl IntoTimestamp for f64 {
    fn into_timestamp(self) -> Result<Timestamp, DbError> {
        if !self.is_finite() {
            return Err(DbError::InvalidTimestamp(self.to_string()));
        }
        let secs = self.floor();
        let micros = ((self - secs) * 1_000_000.0).round() as u32;
        DateTime::from_timestamp(secs as i64, micros.min(999_999) * 1_000)
            .ok_or_else(|| DbError::InvalidTimestamp(self.to_string()))
    }
}

impl IntoTimestamp for &str {
    fn into_timestamp(self) -> Result<Timestamp, DbError> {
        parse_timestamp(self)
    }
}

impl IntoTimestamp for String {
    fn into_timestamp(self) -> Result<Timestamp, DbError> {
        parse_timestamp(&self)
    }
}

impl IntoTimestamp for &String {
    fn into_timestamp(self) -> Result<Timestamp, DbError> {
        parse_timestamp(self)
    }
}

/// Parse an ISO-8601 date or datetime. Naive values are taken as UTC.
pub fn parse_timestamp(input: &str) -> Result<Timestamp, DbError> {
    let s = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(truncate_to_micros(dt.with_timezone(&Utc)));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return naive.into_timestamp();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.into_timestamp();
    }
    Err(DbError::InvalidTimestamp(input.to_string()))
}

/// Human-readable form: `2025-01-01 00:00:00`, with microseconds when present.
pub fn format_timestamp(ts: &Timestamp) -> String {
    if ts.nanosecond() == 0 {
        ts.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }
}

/// ISO-8601 form used by the interchange codec.
pub fn format_iso(ts: &Timestamp) -> String {
    if ts.nanosecond() == 0 {
        ts.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }
}

fn truncate_to_micros(ts: Timestamp) -> Timestamp {
    let nanos = ts.nanosecond();
    ts.with_nanosecond(nanos - nanos % 1_000).unwrap_or(ts)
}
