//! Microsecond timestamps on the monotonic clock.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

const MICROS_PER_SEC: i64 = 1_000_000;

/// A point in time with microsecond resolution.
///
/// Timestamps are read from `CLOCK_MONOTONIC` so that poll-return stamps
/// and timer expirations share one clock that never jumps backwards. The
/// zero value is "invalid" and compares earlier than every real timestamp.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Returns the current time.
    pub fn now() -> Timestamp {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Cannot fail with a supported clock id and a valid pointer.
        let _ = syscall!(clock_gettime(libc::CLOCK_MONOTONIC, &mut ts));
        Timestamp(ts.tv_sec as i64 * MICROS_PER_SEC + ts.tv_nsec as i64 / 1_000)
    }

    /// An invalid (unset) timestamp.
    pub const fn zero() -> Timestamp {
        Timestamp(0)
    }

    /// Returns `true` for any timestamp produced by [`Timestamp::now`].
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Microseconds since the (arbitrary) monotonic epoch.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    pub(crate) fn from_micros(micros: i64) -> Timestamp {
        Timestamp(micros)
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        if self.0 <= earlier.0 {
            Duration::ZERO
        } else {
            Duration::from_micros((self.0 - earlier.0) as u64)
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_micros() as i64)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.duration_since(rhs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / MICROS_PER_SEC, self.0 % MICROS_PER_SEC)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(a <= b);
    }

    #[test]
    fn arithmetic() {
        let t = Timestamp::from_micros(5_000_000);
        let later = t + Duration::from_millis(250);
        assert_eq!(later.as_micros(), 5_250_000);
        assert_eq!(later - t, Duration::from_millis(250));
        assert_eq!(t - later, Duration::ZERO);
    }

    #[test]
    fn zero_is_invalid_and_earliest() {
        assert!(!Timestamp::zero().is_valid());
        assert!(Timestamp::zero() < Timestamp::now());
    }
}
