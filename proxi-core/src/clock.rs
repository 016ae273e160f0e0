//! Wall-clock sources
//!
//! Everything that asks "what interval is it" goes through [`Clock`] so tests
//! can drive time by hand, including backwards jumps.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    /// Move the clock by `delta`, which may be negative
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_both_ways() {
        let start = DateTime::<Utc>::from_timestamp(60_000, 0).unwrap();
        let clock = ManualClock::new(start);

        clock.advance(Duration::minutes(10));
        assert_eq!(clock.now().timestamp(), 60_600);

        clock.advance(Duration::minutes(-15));
        assert_eq!(clock.now().timestamp(), 59_700);
    }
}
