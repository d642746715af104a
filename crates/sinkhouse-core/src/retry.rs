//! Retry bookkeeping for failed upload/import attempts.
//!
//! Delays grow exponentially and are capped:
//!
//! ```text
//! attempt   1      2      3       4        5+
//! delay     2m     8m     32m     128m     3h
//! ```
//!
//! `retry_after` is measured from the last failure, so a fresh failure always
//! pushes the next attempt into the future.

use crate::time::UtcTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2 * 60),
            multiplier: 4,
            max: Duration::from_secs(3 * 60 * 60),
        }
    }
}

impl RetryBackoff {
    /// Delay before the attempt following the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt.max(1) {
            delay = delay.saturating_mul(self.multiplier);
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }

    /// Absolute time of the next attempt after `attempt` failures since `first_failed_at`.
    ///
    /// Sums all delays up to `attempt`, e.g. the third retry happens
    /// `2m + 8m + 32m` after the first failure.
    pub fn retry_at(&self, first_failed_at: UtcTime, attempt: u32) -> UtcTime {
        let total = (1..=attempt.max(1))
            .map(|n| self.delay(n))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d));
        first_failed_at.plus(total)
    }
}

/// Retry fields embedded in files and slices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retryable {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<UtcTime>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Retryable {
    pub fn increment(&mut self, backoff: &RetryBackoff, now: UtcTime, reason: impl Into<String>) {
        self.retry_attempt += 1;
        self.retry_reason = Some(reason.into());
        let first = *self.first_failed_at.get_or_insert(now);
        self.last_failed_at = Some(now);
        self.retry_after = Some(backoff.retry_at(first, self.retry_attempt));
    }

    pub fn reset(&mut self) {
        *self = Retryable::default();
    }

    /// True if a retry is scheduled and its time has not come yet.
    pub fn is_waiting(&self, now: UtcTime) -> bool {
        matches!(self.retry_after, Some(after) if now < after)
    }
}
