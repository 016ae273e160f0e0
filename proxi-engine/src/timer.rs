//! Tokio timer backend and runtime clock
//!
//! Timers are tokio tasks that sleep and then push their [`TimerEvent`] into
//! an unbounded channel owned by the controller. [`RuntimeClock`] reads the
//! system clock, or tokio's clock in paused-time tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use proxi_core::{Clock, Result, TimerBackend, TimerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

struct TokioTimer {
    generation: u64,
    deadline: Instant,
    task: JoinHandle<()>,
}

type TimerTable = Arc<Mutex<HashMap<String, TokioTimer>>>;

/// Timer backend running on the current tokio runtime
pub struct TokioTimerBackend {
    handle: tokio::runtime::Handle,
    events: mpsc::UnboundedSender<TimerEvent>,
    timers: TimerTable,
    next_generation: Mutex<u64>,
}

impl TokioTimerBackend {
    /// Create a backend delivering events into `events`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
            events,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
        }
    }

    fn generation(&self) -> u64 {
        let mut next = self.next_generation.lock();
        *next += 1;
        *next
    }

    fn install(&self, id: &str, generation: u64, deadline: Instant, task: JoinHandle<()>) {
        let previous = self.timers.lock().insert(
            id.to_string(),
            TokioTimer {
                generation,
                deadline,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.lock().len()
    }
}

impl TimerBackend for TokioTimerBackend {
    fn schedule_once(&self, id: &str, delay: Duration, event: TimerEvent) -> Result<()> {
        let generation = self.generation();
        let deadline = Instant::now() + delay;
        let events = self.events.clone();
        let timers = Arc::clone(&self.timers);
        let timer_id = id.to_string();

        // hold the table lock so the task cannot fire before it is installed
        let mut table = self.timers.lock();
        let task = self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut timers = timers.lock();
                if timers.get(&timer_id).map(|t| t.generation) == Some(generation) {
                    timers.remove(&timer_id);
                }
            }
            trace!(timer = %timer_id, ?event, "Timer fired");
            let _ = events.send(event);
        });
        if let Some(previous) = table.insert(
            id.to_string(),
            TokioTimer {
                generation,
                deadline,
                task,
            },
        ) {
            previous.task.abort();
        }
        Ok(())
    }

    fn schedule_repeating(&self, id: &str, interval: Duration, event: TimerEvent) -> Result<()> {
        let generation = self.generation();
        let start = Instant::now() + interval;
        let events = self.events.clone();
        let timer_id = id.to_string();

        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                trace!(timer = %timer_id, ?event, "Repeating timer fired");
                if events.send(event.clone()).is_err() {
                    break;
                }
            }
        });
        self.install(id, generation, start, task);
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<bool> {
        match self.timers.lock().remove(id) {
            Some(timer) => {
                timer.task.abort();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn exists(&self, id: &str) -> bool {
        self.timers.lock().contains_key(id)
    }

    fn time_remaining(&self, id: &str) -> Option<Duration> {
        self.timers
            .lock()
            .get(id)
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    fn name(&self) -> &'static str {
        "tokio"
    }
}

impl Drop for TokioTimerBackend {
    fn drop(&mut self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.task.abort();
        }
    }
}

/// Wall clock for the engine
///
/// [`RuntimeClock::system`] reads the system clock on every call, so wall
/// time stays right across host suspend; tokio instants only schedule
/// sleeps. [`RuntimeClock::starting_at`] pins wall time to tokio's clock
/// instead, which lets paused-time tests move both together.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    anchor: Option<(DateTime<Utc>, Instant)>,
}

impl RuntimeClock {
    /// Wall time `base` at the current tokio instant
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            anchor: Some((base, Instant::now())),
        }
    }

    /// The system wall clock
    pub fn system() -> Self {
        Self { anchor: None }
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        let Some((base, origin)) = self.anchor else {
            return Utc::now();
        };
        let elapsed = Instant::now().saturating_duration_since(origin);
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::MAX);
        base.checked_add_signed(elapsed).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
