//! Upload and import conditions
//!
//! A slice is uploaded, and a file imported, once enough data has been
//! buffered or enough time has passed. The thresholds are checked in a fixed
//! order and the first one met names the reason:
//!
//! ```text
//!   records == 0        -> no,  "no record"
//!   records >= count    -> yes, "count threshold met, ..."
//!   size    >= size     -> yes, "size threshold met, ..."
//!   age     >= time     -> yes, "time threshold met, ..."
//!   otherwise           -> no,  "no condition met"
//! ```
//!
//! [`guard_min_interval`] turns a "yes" into "too soon" while the entity is
//! younger than the configured minimal interval, so a sink under heavy load
//! is not rotated on every check.

use sinkhouse_core::{Conditions, UtcTime, Value};
use std::fmt::Write;
use std::time::Duration;

/// Result of a condition check with a human readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub met: bool,
    pub reason: String,
}

impl Evaluation {
    fn met(reason: String) -> Self {
        Self { met: true, reason }
    }

    fn not_met(reason: impl Into<String>) -> Self {
        Self {
            met: false,
            reason: reason.into(),
        }
    }
}

pub fn evaluate(
    conditions: &Conditions,
    now: UtcTime,
    opened_at: UtcTime,
    stats: &Value,
) -> Evaluation {
    if stats.records_count == 0 {
        return Evaluation::not_met("no record");
    }

    if stats.records_count >= conditions.count {
        return Evaluation::met(format!(
            "count threshold met, records count: {}, threshold: {}",
            stats.records_count, conditions.count
        ));
    }

    if stats.uncompressed_size >= conditions.size {
        return Evaluation::met(format!(
            "size threshold met, records size: {}, threshold: {}",
            stats.uncompressed_size, conditions.size
        ));
    }

    let passed = now.since(opened_at);
    if passed >= conditions.time {
        return Evaluation::met(format!(
            "time threshold met, opened at: {}, passed: {} threshold: {}",
            opened_at,
            format_duration(passed),
            format_duration(conditions.time)
        ));
    }

    Evaluation::not_met("no condition met")
}

/// Suppresses a met condition while the entity is younger than `min_interval`.
pub fn guard_min_interval(
    evaluation: Evaluation,
    min_interval: Duration,
    now: UtcTime,
    opened_at: UtcTime,
) -> Evaluation {
    if !evaluation.met {
        return evaluation;
    }
    let passed = now.since(opened_at);
    if passed < min_interval {
        return Evaluation::not_met(format!(
            "too soon, {}, passed: {} min interval: {}",
            evaluation.reason,
            format_duration(passed),
            format_duration(min_interval)
        ));
    }
    evaluation
}

/// Formats a duration as `1h2m3s`, `1m30s`, `1.5s` or `250ms`.
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms < 1000 {
        return format!("{total_ms}ms");
    }
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let millis = total_ms % 60_000;

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let secs = millis / 1000;
    let frac = millis % 1000;
    if frac == 0 {
        let _ = write!(out, "{secs}s");
    } else {
        let frac = format!("{frac:03}");
        let _ = write!(out, "{secs}.{}s", frac.trim_end_matches('0'));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sinkhouse_core::time::must_parse;
    use sinkhouse_core::ByteSize;

    fn conditions() -> Conditions {
        Conditions {
            count: 100,
            size: ByteSize::kb(10),
            time: Duration::from_secs(60),
        }
    }

    fn stats(records: u64, size: ByteSize) -> Value {
        let mut v = Value::default();
        v.record(
            must_parse("2000-01-01T00:00:01.000Z"),
            records,
            size,
            size,
        );
        v
    }

    #[test]
    fn test_no_record() {
        let opened = must_parse("2000-01-01T00:00:00.000Z");
        let now = must_parse("2000-01-01T01:00:00.000Z");
        let e = evaluate(&conditions(), now, opened, &Value::default());
        assert_eq!(e, Evaluation::not_met("no record"));
    }

    #[test]
    fn test_order_of_checks() {
        let opened = must_parse("2000-01-01T00:00:00.000Z");
        let late = must_parse("2000-01-01T00:01:30.000Z");

        // All thresholds met, count wins.
        let e = evaluate(&conditions(), late, opened, &stats(100, ByteSize::kb(20)));
        assert!(e.met);
        assert_eq!(e.reason, "count threshold met, records count: 100, threshold: 100");

        let e = evaluate(&conditions(), late, opened, &stats(10, ByteSize::kb(20)));
        assert_eq!(
            e.reason,
            "size threshold met, records size: 20 KB, threshold: 10 KB"
        );

        let e = evaluate(&conditions(), late, opened, &stats(10, ByteSize::kb(1)));
        assert_eq!(
            e.reason,
            "time threshold met, opened at: 2000-01-01T00:00:00.000Z, passed: 1m30s threshold: 1m0s"
        );

        let early = must_parse("2000-01-01T00:00:30.000Z");
        let e = evaluate(&conditions(), early, opened, &stats(10, ByteSize::kb(1)));
        assert_eq!(e, Evaluation::not_met("no condition met"));
    }

    #[test]
    fn test_min_interval_guard() {
        let opened = must_parse("2000-01-01T00:00:00.000Z");
        let now = must_parse("2000-01-01T00:00:02.000Z");
        let e = evaluate(&conditions(), now, opened, &stats(100, ByteSize::kb(1)));
        assert!(e.met);

        let guarded = guard_min_interval(e.clone(), Duration::from_secs(5), now, opened);
        assert!(!guarded.met);
        assert!(guarded.reason.starts_with("too soon, count threshold met"));

        let later = must_parse("2000-01-01T00:00:05.000Z");
        assert!(guard_min_interval(e, Duration::from_secs(5), later, opened).met);

        let not_met = Evaluation::not_met("no record");
        assert_eq!(
            guard_min_interval(not_met.clone(), Duration::from_secs(5), now, opened),
            not_met
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m0s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h2m3s");
    }
}
