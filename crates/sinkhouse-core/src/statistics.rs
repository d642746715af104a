//! Statistics values
//!
//! A `Value` holds the counters of one slice at one storage level. Values
//! are summed into per-file, per-sink or per-source aggregates.

use crate::size::ByteSize;
use crate::state::Level;
use crate::time::UtcTime;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Number of slices summed in the value, 1 for a single slice.
    #[serde(default)]
    pub slices_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_record_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_record_at: Option<UtcTime>,
    #[serde(default)]
    pub records_count: u64,
    #[serde(default)]
    pub uncompressed_size: ByteSize,
    #[serde(default)]
    pub compressed_size: ByteSize,
    /// Size in the staging storage, set when the slice is uploaded.
    #[serde(default)]
    pub staging_size: ByteSize,
}

impl Value {
    pub fn is_empty(&self) -> bool {
        self.records_count == 0 && self.slices_count == 0
    }

    /// Adds a batch of records written at `at`.
    pub fn record(&mut self, at: UtcTime, count: u64, uncompressed: ByteSize, compressed: ByteSize) {
        if self.first_record_at.map_or(true, |first| at < first) {
            self.first_record_at = Some(at);
        }
        if self.last_record_at.map_or(true, |last| at > last) {
            self.last_record_at = Some(at);
        }
        self.records_count += count;
        self.uncompressed_size += uncompressed;
        self.compressed_size += compressed;
    }
}

fn min_time(a: Option<UtcTime>, b: Option<UtcTime>) -> Option<UtcTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_time(a: Option<UtcTime>, b: Option<UtcTime>) -> Option<UtcTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

impl Add for Value {
    type Output = Value;

    fn add(mut self, rhs: Value) -> Value {
        self += rhs;
        self
    }
}

impl AddAssign for Value {
    fn add_assign(&mut self, rhs: Value) {
        self.slices_count += rhs.slices_count;
        self.first_record_at = min_time(self.first_record_at, rhs.first_record_at);
        self.last_record_at = max_time(self.last_record_at, rhs.last_record_at);
        self.records_count += rhs.records_count;
        self.uncompressed_size += rhs.uncompressed_size;
        self.compressed_size += rhs.compressed_size;
        self.staging_size += rhs.staging_size;
    }
}

impl<'a> AddAssign<&'a Value> for Value {
    fn add_assign(&mut self, rhs: &'a Value) {
        *self += rhs.clone();
    }
}

/// Statistics of an object split by storage level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregated {
    pub local: Value,
    pub staging: Value,
    pub target: Value,
    pub total: Value,
}

impl Aggregated {
    pub fn add(&mut self, level: Level, value: &Value) {
        match level {
            Level::Local => self.local += value,
            Level::Staging => self.staging += value,
            Level::Target => self.target += value,
        }
        self.total += value;
    }

    pub fn level(&self, level: Level) -> &Value {
        match level {
            Level::Local => &self.local,
            Level::Staging => &self.staging,
            Level::Target => &self.target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::must_parse;

    #[test]
    fn test_record() {
        let mut v = Value::default();
        v.record(
            must_parse("2000-01-01T02:00:00Z"),
            10,
            ByteSize::kb(10),
            ByteSize::kb(2),
        );
        v.record(
            must_parse("2000-01-01T01:00:00Z"),
            5,
            ByteSize::kb(5),
            ByteSize::kb(1),
        );
        assert_eq!(v.first_record_at, Some(must_parse("2000-01-01T01:00:00Z")));
        assert_eq!(v.last_record_at, Some(must_parse("2000-01-01T02:00:00Z")));
        assert_eq!(v.records_count, 15);
        assert_eq!(v.compressed_size, ByteSize::kb(3));
    }

    #[test]
    fn test_aggregate() {
        let a = Value {
            slices_count: 1,
            first_record_at: Some(must_parse("2000-01-01T01:00:00Z")),
            last_record_at: Some(must_parse("2000-01-01T02:00:00Z")),
            records_count: 1,
            uncompressed_size: ByteSize::b(1),
            compressed_size: ByteSize::b(1),
            staging_size: ByteSize::ZERO,
        };
        let b = Value {
            slices_count: 1,
            first_record_at: Some(must_parse("2000-01-01T00:30:00Z")),
            last_record_at: Some(must_parse("2000-01-01T01:30:00Z")),
            records_count: 2,
            uncompressed_size: ByteSize::b(2),
            compressed_size: ByteSize::b(2),
            staging_size: ByteSize::b(2),
        };

        let mut agg = Aggregated::default();
        agg.add(Level::Local, &a);
        agg.add(Level::Staging, &b);

        assert_eq!(agg.local, a);
        assert_eq!(agg.staging, b);
        assert_eq!(agg.total.slices_count, 2);
        assert_eq!(agg.total.records_count, 3);
        assert_eq!(
            agg.total.first_record_at,
            Some(must_parse("2000-01-01T00:30:00Z"))
        );
        assert_eq!(
            agg.total.last_record_at,
            Some(must_parse("2000-01-01T02:00:00Z"))
        );
    }
}
