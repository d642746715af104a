//! Byte sizes with human readable formatting.
//!
//! Sizes use binary multiples (1 KB = 1024 B). They serialize as a plain
//! integer number of bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

pub const B: u64 = 1;
pub const KB: u64 = 1024 * B;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;
pub const TB: u64 = 1024 * GB;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const ZERO: ByteSize = ByteSize(0);

    pub const fn b(n: u64) -> Self {
        Self(n)
    }

    pub const fn kb(n: u64) -> Self {
        Self(n * KB)
    }

    pub const fn mb(n: u64) -> Self {
        Self(n * MB)
    }

    pub const fn gb(n: u64) -> Self {
        Self(n * GB)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Returns `percent` % of the size, rounded down.
    pub fn percent(&self, percent: u64) -> Self {
        Self((self.0 as u128 * percent as u128 / 100) as u64)
    }

    pub fn saturating_sub(&self, other: ByteSize) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (unit, name) = match self.0 {
            n if n >= TB => (TB, "TB"),
            n if n >= GB => (GB, "GB"),
            n if n >= MB => (MB, "MB"),
            n if n >= KB => (KB, "KB"),
            _ => return write!(f, "{} B", self.0),
        };
        let value = self.0 as f64 / unit as f64;
        if value.fract() == 0.0 {
            write!(f, "{} {}", value as u64, name)
        } else {
            write!(f, "{:.1} {}", value, name)
        }
    }
}

impl Add for ByteSize {
    type Output = ByteSize;

    fn add(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for ByteSize {
    fn add_assign(&mut self, rhs: ByteSize) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for ByteSize {
    fn sum<I: Iterator<Item = ByteSize>>(iter: I) -> Self {
        iter.fold(ByteSize::ZERO, |acc, v| acc + v)
    }
}

impl From<u64> for ByteSize {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ByteSize::b(10).to_string(), "10 B");
        assert_eq!(ByteSize::kb(600).to_string(), "600 KB");
        assert_eq!(ByteSize::kb(1200).to_string(), "1.2 MB");
        assert_eq!(ByteSize::mb(5).to_string(), "5 MB");
        assert_eq!(ByteSize::gb(1).to_string(), "1 GB");
    }

    #[test]
    fn test_percent() {
        assert_eq!(ByteSize::mb(100).percent(110), ByteSize::mb(110));
        assert_eq!(ByteSize::b(3).percent(50), ByteSize::b(1));
    }
}
