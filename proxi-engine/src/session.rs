//! Radio session: concurrent advertise and scan duties
//!
//! A [`RadioSession`] owns two tokio tasks against one [`RadioDriver`]:
//!
//! - **advertise**: broadcasts the identifier published on a `watch` channel
//!   and swaps the payload in place whenever the rotator issues a new one.
//!   Between swaps it re-checks the radio capability once per scan interval.
//! - **scan**: scans for `scan_duration` out of every `scan_interval` (or
//!   continuously) and records every observation straight into the
//!   [`ContactStore`]. Duplicates are expected and coalesced there. The
//!   store is flushed on a blocking thread when a window closes, and once
//!   per scan interval while scanning continuously.
//!
//! Transient faults are retried with exponential backoff. A denied
//! capability, or a transient fault that outlives the retry budget, ends the
//! session's duties and is reported exactly once on the fault channel.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proxi_core::{Clock, ContactStore, ProxiError, RadioConfig, RollingProximityIdentifier};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::radio::{Observation, RadioDriver, RadioFault};

/// Which duties a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duties {
    pub advertise: bool,
    pub receive: bool,
}

impl Duties {
    pub fn both() -> Self {
        Self {
            advertise: true,
            receive: true,
        }
    }

    pub fn any(&self) -> bool {
        self.advertise || self.receive
    }
}

/// A terminal radio failure, reported once per session
#[derive(Debug)]
pub struct SessionFault {
    pub session_id: Uuid,
    pub error: ProxiError,
}

/// Wiring shared by every session an engine starts
#[derive(Clone)]
pub struct SessionWiring {
    pub driver: Arc<dyn RadioDriver>,
    pub config: RadioConfig,
    pub contacts: Arc<ContactStore>,
    pub clock: Arc<dyn Clock>,
    pub faults: mpsc::Sender<SessionFault>,
}

enum Attempt<T> {
    Done(T),
    Shutdown,
    Failed(ProxiError),
}

enum ScanEnd {
    Shutdown,
    WindowClosed,
    Interrupted(String),
    Denied(String),
}

struct DutyContext {
    session_id: Uuid,
    config: RadioConfig,
    shutdown: watch::Receiver<bool>,
    faults: mpsc::Sender<SessionFault>,
    reported: Arc<AtomicBool>,
}

impl DutyContext {
    /// Run `op` until it succeeds, is denied, or exhausts the retry budget
    async fn retry<T, F, Fut>(&mut self, duty: &'static str, mut op: F) -> Attempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RadioFault>>,
    {
        let mut attempt = 0u32;
        loop {
            if *self.shutdown.borrow() {
                return Attempt::Shutdown;
            }
            match op().await {
                Ok(value) => return Attempt::Done(value),
                Err(RadioFault::Denied(reason)) => {
                    return Attempt::Failed(ProxiError::RadioUnavailable { reason })
                }
                Err(RadioFault::Transient(reason)) => {
                    attempt += 1;
                    if attempt >= self.config.retry_max_attempts {
                        return Attempt::Failed(ProxiError::RadioRetriesExhausted {
                            duty: duty.to_string(),
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self.config.retry_delay(attempt - 1);
                    warn!(
                        session_id = %self.session_id,
                        duty,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "Transient radio fault, retrying"
                    );
                    if !self.pause(delay).await {
                        return Attempt::Shutdown;
                    }
                }
            }
        }
    }

    /// Sleep unless shutdown arrives first; false on shutdown
    async fn pause(&mut self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => true,
            _ = self.shutdown.changed() => false,
        }
    }

    async fn report(&self, duty: &'static str, error: ProxiError) {
        if self.reported.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.session_id, duty, %error, "Session fault already reported");
            return;
        }
        error!(session_id = %self.session_id, duty, code = error.error_code(), %error, "Radio session failed");
        let _ = self
            .faults
            .send(SessionFault {
                session_id: self.session_id,
                error,
            })
            .await;
    }
}

/// An active advertise/scan session
pub struct RadioSession {
    id: Uuid,
    duties: Duties,
    driver: Arc<dyn RadioDriver>,
    config: RadioConfig,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RadioSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioSession")
            .field("id", &self.id)
            .field("duties", &self.duties)
            .finish_non_exhaustive()
    }
}

impl RadioSession {
    /// Acquire the radio and start the requested duties
    ///
    /// Fails with `RadioUnavailable` if the capability is denied, or
    /// `RadioRetriesExhausted` if transient faults never clear.
    pub async fn start(
        wiring: &SessionWiring,
        duties: Duties,
        identifiers: watch::Receiver<Option<RollingProximityIdentifier>>,
    ) -> proxi_core::Result<Self> {
        if !duties.any() {
            return Err(ProxiError::InvalidConfig {
                field: "duties".to_string(),
                reason: "at least one of advertise or receive is required".to_string(),
            });
        }

        let id = Uuid::new_v4();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let reported = Arc::new(AtomicBool::new(false));
        let context = || DutyContext {
            session_id: id,
            config: wiring.config.clone(),
            shutdown: shutdown_rx.clone(),
            faults: wiring.faults.clone(),
            reported: Arc::clone(&reported),
        };

        let driver = Arc::clone(&wiring.driver);
        let mut startup = context();
        match startup.retry("capability", || driver.check_capability()).await {
            Attempt::Done(()) => {}
            Attempt::Failed(e) => return Err(e),
            Attempt::Shutdown => {
                return Err(ProxiError::Internal {
                    reason: "session shut down while starting".to_string(),
                })
            }
        }

        if duties.advertise {
            let first = (*identifiers.borrow()).ok_or_else(|| ProxiError::Internal {
                reason: "no identifier available to advertise".to_string(),
            })?;
            match startup.retry("advertise", || driver.start_advertising(first)).await {
                Attempt::Done(()) => {}
                Attempt::Failed(e) => return Err(e),
                Attempt::Shutdown => {
                    return Err(ProxiError::Internal {
                        reason: "session shut down while starting".to_string(),
                    })
                }
            }
        }

        let mut tasks = Vec::new();
        if duties.advertise {
            tasks.push(tokio::spawn(advertise_duty(context(), Arc::clone(&driver), identifiers)));
        }
        if duties.receive {
            tasks.push(tokio::spawn(scan_duty(
                context(),
                Arc::clone(&driver),
                Arc::clone(&wiring.contacts),
                Arc::clone(&wiring.clock),
            )));
        }

        info!(
            session_id = %id,
            advertise = duties.advertise,
            receive = duties.receive,
            driver = driver.name(),
            "Radio session started"
        );

        Ok(Self {
            id,
            duties,
            driver,
            config: wiring.config.clone(),
            shutdown,
            tasks,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn duties(&self) -> Duties {
        self.duties
    }

    /// True once every duty has ended on its own (after a terminal fault)
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Cancel both duties and release the radio within the stop deadline
    ///
    /// Contacts already recorded are unaffected.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        let deadline = Instant::now() + self.config.stop_deadline();

        for mut task in std::mem::take(&mut self.tasks) {
            if timeout_at(deadline, &mut task).await.is_err() {
                warn!(session_id = %self.id, "Radio duty missed the stop deadline, aborting");
                task.abort();
            }
        }

        let driver = Arc::clone(&self.driver);
        let release = async {
            if self.duties.advertise {
                if let Err(e) = driver.stop_advertising().await {
                    warn!(session_id = %self.id, error = %e, "Failed to stop advertising");
                }
            }
            if self.duties.receive {
                if let Err(e) = driver.stop_scan().await {
                    warn!(session_id = %self.id, error = %e, "Failed to stop scanning");
                }
            }
        };
        if timeout_at(deadline, release).await.is_err() {
            warn!(session_id = %self.id, "Radio release missed the stop deadline");
        }

        info!(session_id = %self.id, "Radio session stopped");
    }
}

impl Drop for RadioSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn advertise_duty(
    mut ctx: DutyContext,
    driver: Arc<dyn RadioDriver>,
    mut identifiers: watch::Receiver<Option<RollingProximityIdentifier>>,
) {
    let period = ctx.config.scan_interval();
    let mut watchdog = tokio::time::interval_at(Instant::now() + period, period);
    identifiers.borrow_and_update();

    loop {
        tokio::select! {
            _ = ctx.shutdown.changed() => break,
            changed = identifiers.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(identifier) = *identifiers.borrow_and_update() else {
                    continue;
                };
                match ctx.retry("advertise", || driver.start_advertising(identifier)).await {
                    Attempt::Done(()) => {
                        debug!(session_id = %ctx.session_id, %identifier, "Advertising new identifier");
                    }
                    Attempt::Shutdown => break,
                    Attempt::Failed(e) => {
                        ctx.report("advertise", e).await;
                        break;
                    }
                }
            }
            _ = watchdog.tick() => {
                match ctx.retry("advertise", || driver.check_capability()).await {
                    Attempt::Done(()) => {}
                    Attempt::Shutdown => break,
                    Attempt::Failed(e) => {
                        ctx.report("advertise", e).await;
                        break;
                    }
                }
            }
        }
    }
}

async fn scan_duty(
    mut ctx: DutyContext,
    driver: Arc<dyn RadioDriver>,
    contacts: Arc<ContactStore>,
    clock: Arc<dyn Clock>,
) {
    let continuous = ctx.config.scans_continuously();
    let mut interruptions = 0u32;
    let flush_period = ctx.config.scan_interval();
    let mut flush_tick = tokio::time::interval_at(Instant::now() + flush_period, flush_period);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let cycle_start = Instant::now();
        let mut stream = match ctx.retry("scan", || driver.start_scan()).await {
            Attempt::Done(stream) => stream,
            Attempt::Shutdown => break,
            Attempt::Failed(e) => {
                ctx.report("scan", e).await;
                break;
            }
        };
        debug!(session_id = %ctx.session_id, continuous, "Scan window opened");

        let window = sleep_until(cycle_start + ctx.config.scan_duration());
        tokio::pin!(window);

        let end = loop {
            tokio::select! {
                _ = ctx.shutdown.changed() => break ScanEnd::Shutdown,
                _ = &mut window, if !continuous => break ScanEnd::WindowClosed,
                _ = flush_tick.tick(), if continuous => flush(&ctx, &contacts).await,
                item = stream.recv() => match item {
                    Some(Ok(observation)) => {
                        interruptions = 0;
                        record(&ctx, &contacts, clock.as_ref(), observation);
                    }
                    Some(Err(RadioFault::Transient(reason))) => break ScanEnd::Interrupted(reason),
                    Some(Err(RadioFault::Denied(reason))) => break ScanEnd::Denied(reason),
                    None => break ScanEnd::Interrupted("scan stream closed".to_string()),
                },
            }
        };

        if let Err(e) = driver.stop_scan().await {
            warn!(session_id = %ctx.session_id, error = %e, "Failed to close scan window");
        }
        flush(&ctx, &contacts).await;

        match end {
            ScanEnd::Shutdown => break,
            ScanEnd::Denied(reason) => {
                ctx.report("scan", ProxiError::RadioUnavailable { reason }).await;
                break;
            }
            ScanEnd::Interrupted(reason) => {
                interruptions += 1;
                if interruptions >= ctx.config.retry_max_attempts {
                    let error = ProxiError::RadioRetriesExhausted {
                        duty: "scan".to_string(),
                        attempts: interruptions,
                        reason,
                    };
                    ctx.report("scan", error).await;
                    break;
                }
                let delay = ctx.config.retry_delay(interruptions - 1);
                warn!(session_id = %ctx.session_id, attempt = interruptions, %reason, "Scan interrupted, restarting");
                if !ctx.pause(delay).await {
                    break;
                }
            }
            ScanEnd::WindowClosed => {
                interruptions = 0;
                let next_cycle = cycle_start + ctx.config.scan_interval();
                let idle = next_cycle.saturating_duration_since(Instant::now());
                if !ctx.pause(idle).await {
                    break;
                }
            }
        }
    }
}

async fn flush(ctx: &DutyContext, contacts: &Arc<ContactStore>) {
    let contacts = Arc::clone(contacts);
    match tokio::task::spawn_blocking(move || contacts.flush()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(session_id = %ctx.session_id, error = %e, "Failed to persist contacts"),
        Err(e) => error!(session_id = %ctx.session_id, error = %e, "Contact flush task failed"),
    }
}

fn record(ctx: &DutyContext, contacts: &ContactStore, clock: &dyn Clock, observation: Observation) {
    if let Err(e) = contacts.record(observation.identifier, clock.now(), observation.sample) {
        warn!(
            session_id = %ctx.session_id,
            identifier = %observation.identifier,
            error = %e,
            "Failed to record sighting"
        );
    }
}
