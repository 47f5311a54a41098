//! Loop-local time.
//!
//! The event loop, timers and tests all run on this monotonic millisecond
//! clock rather than on `std::time::Instant`, so that tests can elapse time
//! deterministically.
use std::sync::atomic;
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time.
///
/// This clock is monotonic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default, Hash)]
pub struct LocalTime {
    /// Milliseconds since Epoch.
    millis: u64,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).millis;
        let last = LAST.load(atomic::Ordering::SeqCst);

        // Never step backwards, even if the system clock does.
        if now < last {
            Self { millis: last }
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            Self { millis: now }
        }
    }

    /// Construct a local time from whole seconds since Epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs * 1000,
        }
    }

    /// Construct a local time from milliseconds since Epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Whole seconds since Epoch.
    pub const fn as_secs(&self) -> u64 {
        self.millis / 1000
    }

    /// Milliseconds since Epoch.
    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    /// Elapse time by the given duration.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.millis += duration.as_millis()
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system
            .duration_since(UNIX_EPOCH)
            .expect("system time is after the Unix epoch")
            .as_millis() as u64;

        Self { millis }
    }
}

/// Subtract two local times. Yields a duration, saturating at zero.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// Time duration as measured locally.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// Maximum duration.
    pub const MAX: LocalDuration = LocalDuration(u64::MAX);

    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Construct a new duration from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// The number of whole seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// The number of milliseconds in this duration.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.as_millis() < 1000 {
            write!(f, "{} millisecond(s)", self.as_millis())
        } else if self.as_secs() < 60 {
            write!(f, "{} second(s)", self.as_secs())
        } else {
            write!(f, "{} minute(s)", self.as_secs() / 60)
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0 * other)
    }
}

impl std::ops::Div<u32> for LocalDuration {
    type Output = LocalDuration;

    fn div(self, other: u32) -> LocalDuration {
        LocalDuration(self.0 / other as u64)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_display() {
        assert_eq!(LocalDuration::from_millis(980).to_string(), "980 millisecond(s)");
        assert_eq!(LocalDuration::from_secs(90).to_string(), "90 second(s)");
        assert_eq!(LocalDuration::from_mins(2).to_string(), "2 minute(s)");
    }

    #[test]
    fn test_saturating_sub() {
        let early = LocalTime::from_secs(10);
        let late = LocalTime::from_secs(20);

        assert_eq!(late - early, LocalDuration::from_secs(10));
        assert_eq!(early - late, LocalDuration::from_secs(0));
    }

    #[test]
    fn test_elapse() {
        let mut t = LocalTime::from_secs(100);
        t.elapse(LocalDuration::from_mins(1));

        assert_eq!(t, LocalTime::from_secs(160));
    }

    #[test]
    fn test_duration_arithmetic() {
        let gap = LocalDuration::from_secs(1) * 4;

        assert_eq!(gap, LocalDuration::from_secs(4));
        assert_eq!(gap / 2, LocalDuration::from_secs(2));
        assert_eq!(
            gap + LocalDuration::from_millis(500),
            LocalDuration::from_millis(4_500)
        );
        assert_eq!(std::time::Duration::from(gap).as_millis(), 4_000);
    }
}
