// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::{Add, AddAssign};
use core::time::Duration;

pub const MICROS_PER_SEC: i64 = 1_000_000;

/// A monotonic `{seconds, microseconds}` timestamp.
///
/// The wheel does no clock reading of its own; callers sample their
/// monotonic source of choice and hand the samples in as `TimeVal`s.
/// Values are kept normalized so that `0 <= microseconds < 1_000_000`,
/// which makes the derived ordering a plain lexicographic compare.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimeVal {
    seconds: i64,
    microseconds: i32,
}

impl TimeVal {
    pub const ZERO: TimeVal = TimeVal {
        seconds: 0,
        microseconds: 0,
    };

    /// Creates a timestamp from a possibly-unnormalized pair.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "rem_euclid(MICROS_PER_SEC) always fits in i32"
    )]
    #[must_use]
    pub const fn new(seconds: i64, microseconds: i64) -> Self {
        Self {
            seconds: seconds + microseconds.div_euclid(MICROS_PER_SEC),
            microseconds: microseconds.rem_euclid(MICROS_PER_SEC) as i32,
        }
    }

    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self::new(0, millis * 1_000)
    }

    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self::new(0, micros)
    }

    #[must_use]
    pub const fn seconds(&self) -> i64 {
        self.seconds
    }

    #[must_use]
    pub const fn microseconds(&self) -> i32 {
        self.microseconds
    }

    #[expect(clippy::cast_lossless, reason = "i64::from is not const")]
    #[must_use]
    pub const fn as_micros(&self) -> i64 {
        self.seconds * MICROS_PER_SEC + self.microseconds as i64
    }

    /// Signed distance from `earlier` to `self` in microseconds.
    ///
    /// Negative when `self` precedes `earlier`.
    #[expect(clippy::cast_lossless, reason = "i64::from is not const")]
    #[must_use]
    pub const fn micros_since(&self, earlier: TimeVal) -> i64 {
        (self.seconds - earlier.seconds) * MICROS_PER_SEC
            + (self.microseconds as i64 - earlier.microseconds as i64)
    }
}

impl fmt::Display for TimeVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.seconds, self.microseconds)
    }
}

impl Add<Duration> for TimeVal {
    type Output = TimeVal;

    #[expect(
        clippy::cast_possible_wrap,
        reason = "durations of more than i64::MAX seconds are not representable on any clock this crate serves"
    )]
    fn add(self, rhs: Duration) -> TimeVal {
        TimeVal::new(
            self.seconds + rhs.as_secs() as i64,
            i64::from(self.microseconds) + i64::from(rhs.subsec_micros()),
        )
    }
}

impl AddAssign<Duration> for TimeVal {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_overflowing_micros() {
        let t = TimeVal::new(1, 2_500_000);
        assert_eq!(t.seconds(), 3);
        assert_eq!(t.microseconds(), 500_000);
    }

    #[test]
    fn normalizes_negative_micros() {
        let t = TimeVal::new(1, -250_000);
        assert_eq!(t.seconds(), 0);
        assert_eq!(t.microseconds(), 750_000);
        assert_eq!(t.as_micros(), 750_000);
    }

    #[test]
    fn ordering_follows_the_timeline() {
        let a = TimeVal::from_millis(999);
        let b = TimeVal::new(1, 0);
        let c = TimeVal::new(1, 1);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b, TimeVal::from_millis(1_000));
    }

    #[test]
    fn signed_differences() {
        let a = TimeVal::from_millis(250);
        let b = TimeVal::from_millis(1_750);
        assert_eq!(b.micros_since(a), 1_500_000);
        assert_eq!(a.micros_since(b), -1_500_000);
        assert_eq!(a.micros_since(a), 0);
    }

    #[test]
    fn display_prints_the_normalized_pair() {
        assert_eq!(TimeVal::new(12, 345).to_string(), "12.000345");
        assert_eq!(TimeVal::from_millis(1_500).to_string(), "1.500000");
        assert_eq!(TimeVal::ZERO.to_string(), "0.000000");
    }

    #[test]
    fn duration_addition_carries() {
        let mut t = TimeVal::new(0, 900_000);
        t += Duration::from_micros(200_000);
        assert_eq!(t, TimeVal::new(1, 100_000));
        assert_eq!(t + Duration::from_secs(2), TimeVal::new(3, 100_000));
    }
}
