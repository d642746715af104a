//! UTC timestamps with a fixed, sortable text form.
//!
//! Timestamps are part of entity keys (`openedAt` of files and slices), so
//! their string form must sort lexicographically in chronological order.
//! `UtcTime` always renders with millisecond precision and a `Z` suffix:
//!
//! ```text
//! 2000-01-01T01:00:00.000Z
//! ```

use crate::error::{CoreError, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTime(DateTime<Utc>);

impl UtcTime {
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    pub fn from_unix_millis(ms: i64) -> Self {
        match Utc.timestamp_millis_opt(ms).single() {
            Some(t) => Self(t),
            None => Self(DateTime::<Utc>::default()),
        }
    }

    pub fn unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn unix_nanos(&self) -> i64 {
        self.0.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    pub fn is_zero(&self) -> bool {
        self.0.timestamp_millis() == 0
    }

    pub fn plus(&self, d: Duration) -> Self {
        Self(self.0 + ChronoDuration::milliseconds(d.as_millis() as i64))
    }

    pub fn minus(&self, d: Duration) -> Self {
        Self(self.0 - ChronoDuration::milliseconds(d.as_millis() as i64))
    }

    /// Time elapsed since `earlier`, saturating at zero.
    pub fn since(&self, earlier: UtcTime) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for UtcTime {
    fn from(t: DateTime<Utc>) -> Self {
        // Truncate to milliseconds so the value survives a text round trip.
        Self::from_unix_millis(t.timestamp_millis())
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(FORMAT))
    }
}

impl FromStr for UtcTime {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self::from(t.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(s, FORMAT)
            .map(|t| Self::from(Utc.from_utc_datetime(&t)))
            .map_err(|e| CoreError::InvalidTime(format!("{s}: {e}")))
    }
}

impl Serialize for UtcTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UtcTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses a timestamp in tests and fixtures.
///
/// Panics on invalid input.
pub fn must_parse(s: &str) -> UtcTime {
    match s.parse() {
        Ok(t) => t,
        Err(e) => panic!("invalid timestamp {s:?}: {e}"),
    }
}
