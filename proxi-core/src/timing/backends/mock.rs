//! Mock timer backend for testing
//!
//! Records all scheduled timers for inspection. Nothing fires until the test
//! calls [`MockTimerBackend::take_due`].

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::Result;
use crate::timing::{TimerBackend, TimerEvent};

/// Recorded timer
#[derive(Debug, Clone)]
pub struct RecordedTimer {
    pub id: String,
    /// Delay or interval
    pub duration: Duration,
    pub event: TimerEvent,
    pub repeating: bool,
    pub cancelled: bool,
}

/// Mock timer backend that records scheduled timers
#[derive(Debug, Default)]
pub struct MockTimerBackend {
    timers: RwLock<HashMap<String, RecordedTimer>>,
}

impl MockTimerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_timer(&self, id: &str) -> Option<RecordedTimer> {
        self.timers.read().get(id).cloned()
    }

    /// Get all active (non-cancelled) timers
    pub fn active_timers(&self) -> Vec<RecordedTimer> {
        self.timers
            .read()
            .values()
            .filter(|t| !t.cancelled)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.timers.read().values().filter(|t| !t.cancelled).count()
    }

    /// Fire the timer with `id` as if its delay elapsed
    ///
    /// One-shot timers are consumed; repeating timers stay armed.
    pub fn take_due(&self, id: &str) -> Option<TimerEvent> {
        let mut timers = self.timers.write();
        let timer = timers.get(id).filter(|t| !t.cancelled)?;
        let event = timer.event.clone();
        if !timer.repeating {
            timers.remove(id);
        }
        Some(event)
    }
}

impl TimerBackend for MockTimerBackend {
    fn schedule_once(&self, id: &str, delay: Duration, event: TimerEvent) -> Result<()> {
        self.timers.write().insert(
            id.to_string(),
            RecordedTimer {
                id: id.to_string(),
                duration: delay,
                event,
                repeating: false,
                cancelled: false,
            },
        );
        Ok(())
    }

    fn schedule_repeating(&self, id: &str, interval: Duration, event: TimerEvent) -> Result<()> {
        self.timers.write().insert(
            id.to_string(),
            RecordedTimer {
                id: id.to_string(),
                duration: interval,
                event,
                repeating: true,
                cancelled: false,
            },
        );
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<bool> {
        match self.timers.write().get_mut(id) {
            Some(timer) if !timer.cancelled => {
                timer.cancelled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn exists(&self, id: &str) -> bool {
        self.timers
            .read()
            .get(id)
            .map(|t| !t.cancelled)
            .unwrap_or(false)
    }

    fn time_remaining(&self, id: &str) -> Option<Duration> {
        // the mock never counts down
        self.timers
            .read()
            .get(id)
            .filter(|t| !t.cancelled)
            .map(|t| t.duration)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
