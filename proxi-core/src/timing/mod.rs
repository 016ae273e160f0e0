//! # Timers
//!
//! Scheduling seam for interval-boundary rotation and retention sweeps.
//!
//! ```text
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │   IdentifierRotator      │     │   Engine maintenance     │
//! │   (interval boundaries)  │     │   (retention sweep)      │
//! └────────────┬─────────────┘     └────────────┬─────────────┘
//!              └──────────────┬─────────────────┘
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TimerBackend (trait)                     │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │ MockTimerBackend             │ TokioTimerBackend            │
//! │ (testing)                    │ (proxi-engine)               │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Backends hand fired events back to their owner; they never call into the
//! rotator directly. The owner decides how to route the event.

pub mod backends;

use std::time::Duration;

use crate::error::Result;

pub use backends::{MockTimerBackend, RecordedTimer};

/// Timer id for the next interval boundary
pub const ROTATION_TIMER_ID: &str = "proxi:rotation";

/// Timer id for the periodic retention sweep
pub const RETENTION_TIMER_ID: &str = "proxi:retention";

/// Timer events the tracing engine reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The interval `interval` has begun
    IntervalBoundary { interval: u32 },
    /// Time to prune expired keys, contacts and exposures
    RetentionSweep,
}

/// Abstract timer backend
pub trait TimerBackend: Send + Sync {
    /// Schedule a one-shot timer, replacing any timer with the same id
    fn schedule_once(&self, id: &str, delay: Duration, event: TimerEvent) -> Result<()>;

    /// Schedule a repeating timer, replacing any timer with the same id
    fn schedule_repeating(&self, id: &str, interval: Duration, event: TimerEvent) -> Result<()>;

    /// Cancel a scheduled timer
    fn cancel(&self, id: &str) -> Result<bool>;

    /// Check if a timer exists
    fn exists(&self, id: &str) -> bool;

    /// Get time remaining on a timer, if the backend tracks it
    fn time_remaining(&self, id: &str) -> Option<Duration>;

    /// Backend name (for logging)
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_are_object_safe() {
        let backend: Box<dyn TimerBackend> = Box::new(MockTimerBackend::new());
        assert_eq!(backend.name(), "mock");
    }
}
