//! Time representation and kernel clock access.
//!
//! The core works in signed nanoseconds throughout. [`TimeSpec`] is a
//! normalized `(seconds, nanoseconds)` pair where the nanosecond field always
//! lies in `0..1_000_000_000` and carries the same sign convention as
//! `struct timespec` after `timespecsub`: negative intervals have a negative
//! seconds field.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::Duration;

pub const NSEC_PER_SEC: i64 = 1_000_000_000;
pub const ONE_BILLION: f64 = 1.0e9;

/// Which kernel clock a timer or a reading refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockDomain {
    /// `CLOCK_MONOTONIC`: immune to wall-clock steps, used for scheduling.
    Monotonic,
    /// `CLOCK_REALTIME`: wall time, used for absolute timers and timestamps.
    Realtime,
}

impl ClockDomain {
    pub fn as_clockid(self) -> libc::clockid_t {
        match self {
            ClockDomain::Monotonic => libc::CLOCK_MONOTONIC,
            ClockDomain::Realtime => libc::CLOCK_REALTIME,
        }
    }
}

/// A normalized signed time value or interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpec {
    pub sec: i64,
    /// Always in `0..NSEC_PER_SEC`.
    pub nsec: i64,
}

impl TimeSpec {
    pub const ZERO: TimeSpec = TimeSpec { sec: 0, nsec: 0 };

    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }.normalized()
    }

    pub fn from_ns(ns: i64) -> Self {
        Self {
            sec: ns.div_euclid(NSEC_PER_SEC),
            nsec: ns.rem_euclid(NSEC_PER_SEC),
        }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self::from_ns((secs * ONE_BILLION) as i64)
    }

    /// Total nanoseconds. Saturates rather than wrapping on extreme values.
    pub fn as_ns(&self) -> i64 {
        self.sec
            .saturating_mul(NSEC_PER_SEC)
            .saturating_add(self.nsec)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / ONE_BILLION
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    pub fn is_negative(&self) -> bool {
        self.sec < 0
    }

    /// Magnitude in nanoseconds.
    pub fn abs_ns(&self) -> i64 {
        self.as_ns().saturating_abs()
    }

    fn normalized(mut self) -> Self {
        if self.nsec >= NSEC_PER_SEC || self.nsec < 0 {
            self.sec += self.nsec.div_euclid(NSEC_PER_SEC);
            self.nsec = self.nsec.rem_euclid(NSEC_PER_SEC);
        }
        self
    }

    pub fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }

    pub fn from_timespec(ts: libc::timespec) -> Self {
        Self::new(ts.tv_sec as i64, ts.tv_nsec as i64)
    }

    pub fn to_duration(self) -> Duration {
        if self.is_negative() {
            Duration::ZERO
        } else {
            Duration::new(self.sec as u64, self.nsec as u32)
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Self {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i64,
        }
    }

    /// Read the given kernel clock.
    pub fn now(domain: ClockDomain) -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // clock_gettime on CLOCK_MONOTONIC/CLOCK_REALTIME cannot fail with
        // valid arguments.
        unsafe { libc::clock_gettime(domain.as_clockid(), &mut ts) };
        Self::from_timespec(ts)
    }
}

impl Add for TimeSpec {
    type Output = TimeSpec;
    fn add(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec {
            sec: self.sec + rhs.sec,
            nsec: self.nsec + rhs.nsec,
        }
        .normalized()
    }
}

impl AddAssign for TimeSpec {
    fn add_assign(&mut self, rhs: TimeSpec) {
        *self = *self + rhs;
    }
}

impl Sub for TimeSpec {
    type Output = TimeSpec;
    fn sub(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec {
            sec: self.sec - rhs.sec,
            nsec: self.nsec - rhs.nsec,
        }
        .normalized()
    }
}

impl SubAssign for TimeSpec {
    fn sub_assign(&mut self, rhs: TimeSpec) {
        *self = *self - rhs;
    }
}

impl Neg for TimeSpec {
    type Output = TimeSpec;
    fn neg(self) -> TimeSpec {
        TimeSpec::ZERO - self
    }
}

impl PartialOrd for TimeSpec {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeSpec {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.sec, self.nsec).cmp(&(other.sec, other.nsec))
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_negative() {
            let pos = -*self;
            write!(f, "-{}.{:09}", pos.sec, pos.nsec)
        } else {
            write!(f, "{}.{:09}", self.sec, self.nsec)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_carries_nanoseconds() {
        let t = TimeSpec::new(1, 1_500_000_000);
        assert_eq!(t, TimeSpec { sec: 2, nsec: 500_000_000 });
    }

    #[test]
    fn test_negative_interval_convention() {
        let a = TimeSpec::new(5, 100);
        let b = TimeSpec::new(7, 50);
        let d = a - b;
        assert!(d.is_negative());
        assert_eq!(d.as_ns(), -(2 * NSEC_PER_SEC) + 50);
        assert_eq!(a, b + d);
    }

    #[test]
    fn test_ns_round_trip() {
        for ns in [0i64, 1, -1, 999_999_999, -999_999_999, 1_000_000_001, -5_400_000_000] {
            assert_eq!(TimeSpec::from_ns(ns).as_ns(), ns);
        }
    }

    #[test]
    fn test_display_sign() {
        assert_eq!(TimeSpec::from_ns(-1).to_string(), "-0.000000001");
        assert_eq!(TimeSpec::new(3, 5).to_string(), "3.000000005");
    }

    #[test]
    fn test_monotonic_advances() {
        let a = TimeSpec::now(ClockDomain::Monotonic);
        let b = TimeSpec::now(ClockDomain::Monotonic);
        assert!(b >= a);
    }
}
