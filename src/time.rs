//! Time APIs for obtaining the current time and calculating with points in
//! time and durations.
//!
//! These APIs are made for the stack and are not meant to be general
//! purpose. Timestamps are 64-bit microsecond counts, which never wrap in
//! practice; durations are 32-bit and cover everything the Link-Layer
//! schedules (the longest being the supervision timeout of up to 32 s).

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};
use core::sync::atomic::{AtomicU32, Ordering};

/// A duration with microsecond resolution.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(u32);

impl Duration {
    /// The inter-frame spacing between BLE packets on the same channel.
    pub const T_IFS: Self = Duration(150);

    /// A zero-length duration.
    pub const ZERO: Self = Duration(0);

    /// Creates a `Duration` from a number of microseconds.
    pub const fn from_micros(micros: u32) -> Self {
        Duration(micros)
    }

    /// Creates a `Duration` representing the given number of milliseconds.
    pub const fn from_millis(millis: u16) -> Self {
        Duration(millis as u32 * 1_000)
    }

    /// Creates a `Duration` representing a number of seconds.
    pub const fn from_secs(secs: u16) -> Self {
        Duration(secs as u32 * 1_000_000)
    }

    /// Returns the number of microseconds represented by `self`.
    pub fn as_micros(&self) -> u32 {
        self.0
    }

    /// Returns the number of whole milliseconds that fit in `self`.
    pub fn whole_millis(&self) -> u32 {
        self.0 / 1_000
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.checked_add(rhs.0).expect("duration overflow"))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.checked_sub(rhs.0).expect("duration underflow"))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 && self.0 % 1_000_000 == 0 {
            write!(f, "{}s", self.0 / 1_000_000)
        } else if self.0 >= 1_000 && self.0 % 1_000 == 0 {
            write!(f, "{}ms", self.0 / 1_000)
        } else {
            write!(f, "{}µs", self.0)
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A point in time, relative to an unspecified epoch.
///
/// Microsecond resolution, 64 bits wide: a connection can stay up for
/// hundreds of thousands of years before this wraps, so anchor points are
/// simply monotonically non-decreasing.
///
/// `Instant`s are obtained from a [`Timer`]. `Instant`s created by different
/// `Timer` instances are not comparable.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    /// Creates an `Instant` from raw microseconds since the timer's epoch.
    ///
    /// This should only be called by [`Timer`] implementations.
    pub fn from_raw_micros(micros: u64) -> Self {
        Instant(micros)
    }

    /// Returns the raw microsecond value of `self`.
    pub fn raw_micros(&self) -> u64 {
        self.0
    }

    /// Calculates the time that passed between `earlier` and `self`.
    ///
    /// Both instants must come from the same [`Timer`], and `earlier` must
    /// not be later than `self`.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        let micros = self.0.checked_sub(earlier.0).expect("negative duration");
        debug_assert!(micros <= u64::from(u32::MAX));
        Duration(micros as u32)
    }

    /// Returns an `Instant` that lies `d` before `self`, saturating at the
    /// timer's epoch.
    pub fn saturating_sub(&self, d: Duration) -> Instant {
        Instant(self.0.saturating_sub(u64::from(d.as_micros())))
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0 + u64::from(d.as_micros()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}s", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Trait for time providers.
///
/// The hardware interface has to provide an implementation of `Timer` with
/// microsecond accuracy. All blocking performed by the stack goes through
/// this trait, so a mock implementation gives tests full control over time.
pub trait Timer {
    /// Obtains the current time as an [`Instant`].
    ///
    /// Values returned by this function must never move backwards in time.
    fn now(&self) -> Instant;

    /// Busy-waits for the given duration.
    fn delay(&mut self, d: Duration) {
        let deadline = self.now() + d;
        self.wait_until(deadline);
    }

    /// Blocks until `deadline` is reached, returning promptly once it is.
    ///
    /// A deadline in the past returns immediately.
    fn wait_until(&mut self, deadline: Instant) {
        while self.now() < deadline {}
    }
}

/// Widens a wrapping 32-bit microsecond counter into the 64-bit timescale.
///
/// Hardware timers are usually 32 bits wide and wrap after about 71 minutes.
/// The platform's overflow interrupt calls [`Extender32::overflow`]; reads
/// combine the overflow count with the hardware counter and retry until both
/// halves are observed consistently, so a read racing the overflow interrupt
/// can never produce a timestamp from the wrong epoch.
pub struct Extender32 {
    high: AtomicU32,
}

impl Extender32 {
    /// Creates an extender with no overflows recorded yet.
    pub const fn new() -> Self {
        Extender32 {
            high: AtomicU32::new(0),
        }
    }

    /// Records one overflow of the hardware counter.
    ///
    /// Call this from the timer's overflow interrupt handler.
    pub fn overflow(&self) {
        self.high.fetch_add(1, Ordering::Relaxed);
    }

    /// Combines the current hardware counter value, read via `read_low`,
    /// with the recorded overflow count.
    ///
    /// `read_low` may be called multiple times.
    pub fn now(&self, mut read_low: impl FnMut() -> u32) -> Instant {
        loop {
            let high = self.high.load(Ordering::Acquire);
            let low = read_low();
            if self.high.load(Ordering::Acquire) == high {
                return Instant::from_raw_micros(u64::from(high) << 32 | u64::from(low));
            }
        }
    }
}
