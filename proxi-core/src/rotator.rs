//! Broadcast identifier rotation
//!
//! [`IdentifierRotator`] turns the current epoch's tracing key into the
//! identifier for the current interval and re-derives it at every interval
//! boundary.
//!
//! ```text
//!   start()            boundary timer           stop()
//! Idle ──► Scheduled ──► Active ──┐ ◄─┘ ... Active ──► Idle
//!                                 └──► derive next, then swap
//! ```
//!
//! The next identifier is derived before the published one is replaced, so a
//! reader of [`IdentifierRotator::current`] never finds the slot empty while
//! the rotator is active. Interval indices never go backwards: if the wall
//! clock jumps back, the rotator keeps broadcasting the last issued
//! identifier until time catches up.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use proxi_crypto::RollingProximityIdentifier;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::keys::KeyMaterial;
use crate::timing::{TimerBackend, TimerEvent, ROTATION_TIMER_ID};

/// Rotator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotatorState {
    Idle,
    Scheduled,
    Active,
}

/// The identifier currently being broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentIdentifier {
    pub identifier: RollingProximityIdentifier,
    pub interval: u32,
    pub epoch: u32,
    /// End of the interval this identifier belongs to
    pub valid_until: DateTime<Utc>,
}

/// Delay before retrying a boundary whose identifier could not be issued
pub const ROTATION_RETRY_DELAY: StdDuration = StdDuration::from_secs(30);

type Listener = Box<dyn Fn(&CurrentIdentifier) + Send + Sync>;

struct RotatorInner {
    state: RotatorState,
    last_issued: Option<u32>,
}

/// Derives and rotates broadcast identifiers on interval boundaries
pub struct IdentifierRotator {
    protocol: ProtocolConfig,
    keys: Arc<KeyMaterial>,
    timers: Arc<dyn TimerBackend>,
    clock: Arc<dyn Clock>,
    current: ArcSwapOption<CurrentIdentifier>,
    inner: Mutex<RotatorInner>,
    listeners: RwLock<Vec<Listener>>,
}

impl IdentifierRotator {
    pub fn new(
        protocol: ProtocolConfig,
        keys: Arc<KeyMaterial>,
        timers: Arc<dyn TimerBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            protocol,
            keys,
            timers,
            clock,
            current: ArcSwapOption::empty(),
            inner: Mutex::new(RotatorInner {
                state: RotatorState::Idle,
                last_issued: None,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback run after every newly issued identifier
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&CurrentIdentifier) + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(listener));
    }

    pub fn state(&self) -> RotatorState {
        self.inner.lock().state
    }

    /// The identifier to broadcast right now, `None` unless active
    pub fn current(&self) -> Option<Arc<CurrentIdentifier>> {
        self.current.load_full()
    }

    /// Issue the identifier for the current interval and arm the boundary timer
    ///
    /// A no-op returning the current identifier when already started. On
    /// failure the rotator is back in `Idle` with nothing published.
    pub fn start(&self) -> Result<Arc<CurrentIdentifier>> {
        let mut inner = self.inner.lock();
        if inner.state != RotatorState::Idle {
            if let Some(current) = self.current() {
                return Ok(current);
            }
        }

        inner.state = RotatorState::Scheduled;
        let issued = self.issue(&mut inner).and_then(|current| {
            self.arm(&current)?;
            Ok(current)
        });

        match issued {
            Ok(current) => {
                inner.state = RotatorState::Active;
                info!(
                    interval = current.interval,
                    epoch = current.epoch,
                    timer_backend = self.timers.name(),
                    "Identifier rotation started"
                );
                Ok(current)
            }
            Err(e) => {
                inner.state = RotatorState::Idle;
                self.current.store(None);
                let _ = self.timers.cancel(ROTATION_TIMER_ID);
                Err(e)
            }
        }
    }

    /// Handle a timer event routed from the timer backend
    ///
    /// Returns the identifier that was issued, or `None` when the event was
    /// not for the rotator, the rotator is not active, or nothing changed.
    /// When the identifier cannot be issued the previous one stays published
    /// and the boundary is retried after [`ROTATION_RETRY_DELAY`].
    pub fn on_timer(&self, event: &TimerEvent) -> Result<Option<Arc<CurrentIdentifier>>> {
        let TimerEvent::IntervalBoundary { interval } = *event else {
            return Ok(None);
        };

        let mut inner = self.inner.lock();
        if inner.state != RotatorState::Active {
            debug!(interval, "Ignoring boundary while not active");
            return Ok(None);
        }

        let before = inner.last_issued;
        let current = match self.issue(&mut inner) {
            Ok(current) => current,
            Err(e) => {
                warn!(interval, error = %e, "Could not issue identifier, retrying boundary");
                self.timers.schedule_once(
                    ROTATION_TIMER_ID,
                    ROTATION_RETRY_DELAY,
                    TimerEvent::IntervalBoundary { interval },
                )?;
                return Err(e);
            }
        };
        self.arm(&current)?;

        if before == Some(current.interval) {
            // fired early, or the clock moved back
            debug!(expected = interval, interval = current.interval, "Boundary not reached yet");
            Ok(None)
        } else {
            Ok(Some(current))
        }
    }

    /// Cancel the boundary timer and discard the current identifier
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == RotatorState::Idle {
            return Ok(());
        }
        self.timers.cancel(ROTATION_TIMER_ID)?;
        self.current.store(None);
        inner.state = RotatorState::Idle;
        info!("Identifier rotation stopped");
        Ok(())
    }

    /// Interval to broadcast for, never earlier than the last one issued
    fn target_interval(&self, inner: &RotatorInner) -> u32 {
        let interval = self.protocol.interval_at(self.clock.now());
        match inner.last_issued {
            Some(last) if interval < last => {
                warn!(interval, last_issued = last, "Clock moved backwards, holding last identifier");
                last
            }
            _ => interval,
        }
    }

    fn issue(&self, inner: &mut RotatorInner) -> Result<Arc<CurrentIdentifier>> {
        let interval = self.target_interval(inner);
        if let Some(current) = self.current() {
            if current.interval == interval {
                return Ok(current);
            }
        }

        let epoch = self.protocol.epoch_of(interval);
        let key = self.keys.current_key(epoch)?;
        let next = Arc::new(CurrentIdentifier {
            identifier: KeyMaterial::derive_rpi(&key, interval),
            interval,
            epoch,
            valid_until: self.protocol.interval_end(interval),
        });

        self.current.store(Some(Arc::clone(&next)));
        inner.last_issued = Some(interval);
        debug!(interval, epoch, identifier = %next.identifier, "Issued identifier");

        for listener in self.listeners.read().iter() {
            listener(&next);
        }
        Ok(next)
    }

    fn arm(&self, current: &CurrentIdentifier) -> Result<()> {
        let delay = (current.valid_until - self.clock.now())
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        self.timers.schedule_once(
            ROTATION_TIMER_ID,
            delay,
            TimerEvent::IntervalBoundary {
                interval: current.interval + 1,
            },
        )
    }
}
