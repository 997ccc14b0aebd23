//! Clocks used to stamp feed events and take watcher watermarks.
//!
//! Events are stamped with millisecond precision, matching the resolution at
//! which reporting devices record their capture time.

use std::sync::Mutex;

use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};

/// A source of "now".
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time truncated to milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_millis(Utc::now())
    }
}

/// A manually advanced clock for deterministic tests and replays.
///
/// ```
/// use chrono::Duration;
/// use hazardwatch::time::{Clock, ManualClock};
///
/// let clock = ManualClock::from_millis(1_000);
/// clock.advance(Duration::milliseconds(5));
/// assert_eq!(clock.now().timestamp_millis(), 1_005);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(truncate_millis(at)),
        }
    }

    /// Creates a clock frozen at `millis` since the Unix epoch.
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self::new(from_millis(millis))
    }

    /// Moves the clock forward (or backward, for negative durations).
    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += by;
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = truncate_millis(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Converts milliseconds since the Unix epoch to a UTC timestamp.
///
/// Values outside chrono's representable range saturate to the epoch.
#[must_use]
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or(DateTime::UNIX_EPOCH)
}

/// Drops sub-millisecond precision.
#[must_use]
pub fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::milliseconds(1)).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_has_millisecond_precision() {
        let now = SystemClock.now();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn manual_clock_advances_and_sets() {
        let clock = ManualClock::from_millis(10);
        clock.advance(Duration::milliseconds(-3));
        assert_eq!(clock.now().timestamp_millis(), 7);
        clock.set(from_millis(42));
        assert_eq!(clock.now().timestamp_millis(), 42);
    }

    #[test]
    fn from_millis_round_trips() {
        assert_eq!(from_millis(1_700_000_000_123).timestamp_millis(), 1_700_000_000_123);
    }
}
