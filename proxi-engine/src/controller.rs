//! Tracing engine controller
//!
//! One actor task owns every piece of mutable engine state. Callers hold a
//! cloneable [`EngineHandle`] and talk to it over an `mpsc` command channel
//! with `oneshot` replies. Status is published on a `watch` channel, so
//! [`EngineHandle::status`] never waits on the actor, and notifications fan
//! out over `broadcast`.
//!
//! ```text
//!   EngineHandle ──commands──► EngineActor ◄──timer events── TokioTimerBackend
//!        ▲                       │   ▲   ◄──faults──────── RadioSession
//!        │ status (watch)        │   └──evaluation done── spawn_blocking(matcher)
//!        └───────────────────────┘
//! ```
//!
//! Matching runs on the blocking pool against a contact snapshot; broadcast
//! and scan keep running while it does.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use proxi_core::timing::RETENTION_TIMER_ID;
use proxi_core::{
    Clock, ContactStore, EngineConfig, EngineSettings, ExposureEvent, ExposureMatcher,
    IdentifierRotator, InMemoryStorage, KeyMaterial, KeySource, MatchReport, ProxiError,
    PublishedKey, RollingProximityIdentifier, StorageBackend, TimerBackend, TimerEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::radio::RadioDriver;
use crate::session::{Duties, RadioSession, SessionFault, SessionWiring};
use crate::status::{EngineState, EngineStatus, ErrorState, InfectionStatus, Notification};
use crate::timer::{RuntimeClock, TokioTimerBackend};

const COMMAND_BUFFER: usize = 32;
const NOTIFICATION_BUFFER: usize = 64;
const FAULT_BUFFER: usize = 8;

/// Rows removed by one retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneSummary {
    pub keys: usize,
    pub contacts: usize,
    pub exposures: usize,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Start { duties: Duties, reply: Reply<EngineStatus> },
    Stop { reply: Reply<EngineStatus> },
    Evaluate { keys: Vec<PublishedKey>, reply: Reply<MatchReport> },
    Exposures { reply: Reply<Vec<ExposureEvent>> },
    Acknowledge { id: String, reply: Reply<bool> },
    ReportInfected { onset: DateTime<Utc>, reply: Reply<Vec<PublishedKey>> },
    ClearData { reply: Reply<()> },
    Prune { reply: Reply<PruneSummary> },
    Shutdown { reply: oneshot::Sender<()> },
}

struct EvaluationDone {
    result: Result<MatchReport>,
    reply: Reply<MatchReport>,
}

/// Builds and launches a tracing engine
pub struct EngineBuilder {
    driver: Arc<dyn RadioDriver>,
    config: EngineConfig,
    storage: Option<Arc<dyn StorageBackend>>,
    clock: Option<Arc<dyn Clock>>,
    key_source: Option<Arc<dyn KeySource>>,
    auto_resume: bool,
}

impl EngineBuilder {
    pub fn new(driver: Arc<dyn RadioDriver>) -> Self {
        Self {
            driver,
            config: EngineConfig::default(),
            storage: None,
            clock: None,
            key_source: None,
            auto_resume: true,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable storage (default: in-memory)
    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Wall clock (default: [`RuntimeClock::system`])
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_key_source(mut self, source: Arc<dyn KeySource>) -> Self {
        self.key_source = Some(source);
        self
    }

    /// Restart tracing on launch if it was enabled when the process ended
    pub fn with_auto_resume(mut self, enabled: bool) -> Self {
        self.auto_resume = enabled;
        self
    }

    /// Load persisted state, prune it, spawn the controller and resume
    ///
    /// Must be called from within a tokio runtime. A failed resume leaves the
    /// engine stopped with the error in its status; it does not fail launch.
    pub async fn launch(self) -> Result<EngineHandle> {
        let config = self.config;
        config.validate()?;

        let storage: Arc<dyn StorageBackend> = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        storage.health_check()?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(RuntimeClock::system()));

        let mut keys = KeyMaterial::new(config.protocol.clone(), storage.clone(), clock.clone())?;
        if let Some(source) = self.key_source {
            keys = keys.with_key_source(source);
        }
        let keys = Arc::new(keys);
        let contacts = Arc::new(ContactStore::new(
            config.protocol.clone(),
            config.signal.clone(),
            storage.clone(),
            clock.clone(),
        )?);

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let timers = Arc::new(TokioTimerBackend::new(timer_tx));
        let rotator = Arc::new(IdentifierRotator::new(
            config.protocol.clone(),
            keys.clone(),
            timers.clone(),
            clock.clone(),
        ));

        let (identifiers, _) = watch::channel(None);
        let identifiers = Arc::new(identifiers);
        {
            let identifiers = Arc::clone(&identifiers);
            rotator.subscribe(move |current| {
                identifiers.send_replace(Some(current.identifier));
            });
        }

        let (fault_tx, fault_rx) = mpsc::channel(FAULT_BUFFER);
        let wiring = SessionWiring {
            driver: self.driver,
            config: config.radio.clone(),
            contacts: contacts.clone(),
            clock: clock.clone(),
            faults: fault_tx,
        };

        let settings = storage.load_settings()?;
        let resume = self.auto_resume && settings.tracing_enabled();
        let resume_duties = Duties {
            advertise: settings.advertising_enabled,
            receive: settings.receiving_enabled,
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(EngineStatus::default());
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let (evaluation_tx, evaluation_rx) = mpsc::unbounded_channel();

        let mut actor = EngineActor {
            matcher: Arc::new(ExposureMatcher::new(config.protocol.clone(), config.matching.clone())),
            config,
            clock,
            storage,
            keys,
            contacts: contacts.clone(),
            rotator,
            timers,
            wiring,
            identifiers,
            session: None,
            state: EngineState::Stopped,
            settings,
            errors: Vec::new(),
            evaluations_in_flight: 0,
            commands: command_rx,
            timer_events: timer_rx,
            faults: fault_rx,
            evaluations: evaluation_rx,
            evaluation_tx,
            status: status_tx,
            notifications: notifications.clone(),
        };

        let pruned = actor.sweep()?;
        debug!(?pruned, "Launch sweep complete");
        actor.timers.schedule_repeating(
            RETENTION_TIMER_ID,
            actor.config.retention_sweep(),
            TimerEvent::RetentionSweep,
        )?;
        actor.publish_status();
        tokio::spawn(actor.run());

        let handle = EngineHandle {
            commands: command_tx,
            contacts,
            status: status_rx,
            notifications,
        };

        if resume {
            match handle.start(resume_duties.advertise, resume_duties.receive).await {
                Ok(_) => info!("Resumed tracing after restart"),
                Err(e) => warn!(error = %e, code = e.error_code(), "Could not resume tracing"),
            }
        }
        Ok(handle)
    }
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    contacts: Arc<ContactStore>,
    status: watch::Receiver<EngineStatus>,
    notifications: broadcast::Sender<Notification>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| EngineError::EngineShutDown)?;
        response.await.map_err(|_| EngineError::EngineShutDown)?
    }

    /// Start tracing; a no-op returning the status when already running
    pub async fn start(&self, advertise: bool, receive: bool) -> Result<EngineStatus> {
        let duties = Duties { advertise, receive };
        self.request(|reply| Command::Start { duties, reply }).await
    }

    /// Stop tracing and release the radio
    pub async fn stop(&self) -> Result<EngineStatus> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Last published status with a live contact count; never waits on the
    /// controller
    pub fn status(&self) -> EngineStatus {
        let mut status = self.status.borrow().clone();
        status.contact_count = self.contacts.len();
        status
    }

    /// Receiver that wakes on every status change
    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Match published diagnosis keys against the contact history
    ///
    /// Malformed keys are listed in the report and skipped.
    pub async fn evaluate(&self, keys: Vec<PublishedKey>) -> Result<MatchReport> {
        self.request(|reply| Command::Evaluate { keys, reply }).await
    }

    /// Unacknowledged exposure events, oldest epoch first
    pub async fn exposures(&self) -> Result<Vec<ExposureEvent>> {
        self.request(|reply| Command::Exposures { reply }).await
    }

    /// Dismiss an exposure event; false if it was not found
    pub async fn acknowledge(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| Command::Acknowledge { id, reply }).await
    }

    /// Mark the device infected and return its diagnosis keys since `onset`
    pub async fn report_infected(&self, onset: DateTime<Utc>) -> Result<Vec<PublishedKey>> {
        self.request(|reply| Command::ReportInfected { onset, reply }).await
    }

    /// Wipe keys, contacts, exposures and settings; the engine must be stopped
    pub async fn clear_data(&self) -> Result<()> {
        self.request(|reply| Command::ClearData { reply }).await
    }

    /// Run a retention sweep now
    pub async fn prune(&self) -> Result<PruneSummary> {
        self.request(|reply| Command::Prune { reply }).await
    }

    /// Stop tracing without touching the persisted enabled flags and end the
    /// controller task
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| EngineError::EngineShutDown)?;
        done.await.map_err(|_| EngineError::EngineShutDown)
    }
}

struct EngineActor {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn StorageBackend>,
    keys: Arc<KeyMaterial>,
    contacts: Arc<ContactStore>,
    rotator: Arc<IdentifierRotator>,
    matcher: Arc<ExposureMatcher>,
    timers: Arc<TokioTimerBackend>,
    wiring: SessionWiring,
    identifiers: Arc<watch::Sender<Option<RollingProximityIdentifier>>>,
    session: Option<RadioSession>,
    state: EngineState,
    settings: EngineSettings,
    errors: Vec<ErrorState>,
    evaluations_in_flight: usize,
    commands: mpsc::Receiver<Command>,
    timer_events: mpsc::UnboundedReceiver<TimerEvent>,
    faults: mpsc::Receiver<SessionFault>,
    evaluations: mpsc::UnboundedReceiver<EvaluationDone>,
    evaluation_tx: mpsc::UnboundedSender<EvaluationDone>,
    status: watch::Sender<EngineStatus>,
    notifications: broadcast::Sender<Notification>,
}

impl EngineActor {
    async fn run(mut self) {
        info!(timer_backend = self.timers.name(), "Tracing engine controller running");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.timer_events.recv() => self.on_timer(event).await,
                Some(fault) = self.faults.recv() => self.on_fault(fault).await,
                Some(done) = self.evaluations.recv() => self.on_evaluation(done),
            }
        }

        info!("Tracing engine controller exited");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { duties, reply } => {
                let result = self.start(duties).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            Command::Evaluate { keys, reply } => self.evaluate(keys, reply),
            Command::Exposures { reply } => {
                let _ = reply.send(self.exposures());
            }
            Command::Acknowledge { id, reply } => {
                let _ = reply.send(self.acknowledge(&id));
            }
            Command::ReportInfected { onset, reply } => {
                let _ = reply.send(self.report_infected(onset));
            }
            Command::ClearData { reply } => {
                let _ = reply.send(self.clear_data());
            }
            Command::Prune { reply } => {
                let result = self.sweep().map_err(EngineError::from);
                self.publish_status();
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    // ─── lifecycle ──────────────────────────────────────────────────────

    async fn start(&mut self, duties: Duties) -> Result<EngineStatus> {
        if self.state.is_active() {
            debug!(state = %self.state, "Start requested while active");
            return Ok(self.status.borrow().clone());
        }
        if !duties.any() {
            return Err(ProxiError::InvalidConfig {
                field: "duties".to_string(),
                reason: "at least one of advertise or receive is required".to_string(),
            }
            .into());
        }

        self.errors.clear();
        self.set_state(EngineState::Starting);

        let session = match self.bring_up(duties).await {
            Ok(session) => session,
            Err(e) => {
                self.release_identifiers();
                self.record_failure(&e);
                self.set_state(EngineState::Stopped);
                return Err(e.into());
            }
        };

        self.session = Some(session);
        self.settings.advertising_enabled = duties.advertise;
        self.settings.receiving_enabled = duties.receive;
        self.save_settings();
        self.set_state(EngineState::Running);
        Ok(self.status.borrow().clone())
    }

    async fn bring_up(&mut self, duties: Duties) -> proxi_core::Result<RadioSession> {
        if duties.advertise {
            let current = self.rotator.start()?;
            self.identifiers.send_replace(Some(current.identifier));
        } else {
            // receivers still own a key so they can report a diagnosis later
            self.keys.key_for_now()?;
        }
        RadioSession::start(&self.wiring, duties, self.identifiers.subscribe()).await
    }

    async fn stop(&mut self) -> Result<EngineStatus> {
        if self.state == EngineState::Stopped {
            return Ok(self.status.borrow().clone());
        }
        self.teardown().await;
        self.settings.advertising_enabled = false;
        self.settings.receiving_enabled = false;
        self.save_settings();
        self.set_state(EngineState::Stopped);
        Ok(self.status.borrow().clone())
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
        self.release_identifiers();
        self.flush_contacts().await;
    }

    async fn flush_contacts(&self) {
        let contacts = Arc::clone(&self.contacts);
        match tokio::task::spawn_blocking(move || contacts.flush()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to persist contacts"),
            Err(e) => warn!(error = %e, "Contact flush task failed"),
        }
    }

    fn release_identifiers(&mut self) {
        if let Err(e) = self.rotator.stop() {
            warn!(error = %e, "Failed to stop identifier rotation");
        }
        self.identifiers.send_replace(None);
    }

    /// Fatal error while running: stop everything and report it once
    async fn fail(&mut self, error: ProxiError) {
        warn!(code = error.error_code(), %error, "Stopping tracing after fatal error");
        self.teardown().await;
        self.record_failure(&error);
        self.set_state(EngineState::Stopped);
    }

    async fn shutdown(&mut self) {
        self.teardown().await;
        let _ = self.timers.cancel(RETENTION_TIMER_ID);
        self.set_state(EngineState::Stopped);
    }

    // ─── events ─────────────────────────────────────────────────────────

    async fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::IntervalBoundary { .. } => match self.rotator.on_timer(&event) {
                Ok(Some(current)) => {
                    debug!(interval = current.interval, epoch = current.epoch, "Rotated identifier");
                    if self.errors.contains(&ErrorState::Storage) {
                        info!(interval = current.interval, "Identifier rotation recovered");
                        self.errors.retain(|e| *e != ErrorState::Storage);
                    }
                    self.publish_status();
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => self.fail(e).await,
                Err(e) => {
                    // the rotator re-arms the boundary; surface the condition until it recovers
                    warn!(code = e.error_code(), error = %e, "Identifier rotation failed");
                    let state = ErrorState::from_error(&e).unwrap_or(ErrorState::Storage);
                    if !self.errors.contains(&state) {
                        self.errors.push(state);
                    }
                    self.publish_status();
                }
            },
            TimerEvent::RetentionSweep => {
                if let Err(e) = self.sweep() {
                    warn!(error = %e, "Retention sweep failed");
                }
                self.publish_status();
            }
        }
    }

    async fn on_fault(&mut self, fault: SessionFault) {
        let current = self.session.as_ref().map(|s| s.id());
        if current != Some(fault.session_id) {
            debug!(session_id = %fault.session_id, "Ignoring fault from a finished session");
            return;
        }
        self.fail(fault.error).await;
    }

    // ─── matching ───────────────────────────────────────────────────────

    fn evaluate(&mut self, keys: Vec<PublishedKey>, reply: Reply<MatchReport>) {
        let matcher = Arc::clone(&self.matcher);
        let snapshot = self.contacts.snapshot();
        let done = self.evaluation_tx.clone();

        self.evaluations_in_flight += 1;
        if self.state == EngineState::Running {
            self.set_state(EngineState::CheckingExposure);
        }

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || matcher.evaluate(&keys, &snapshot))
                .await
                .map_err(EngineError::from);
            let _ = done.send(EvaluationDone { result, reply });
        });
    }

    fn on_evaluation(&mut self, done: EvaluationDone) {
        self.evaluations_in_flight = self.evaluations_in_flight.saturating_sub(1);
        let result = done
            .result
            .and_then(|report| self.store_exposures(&report).map(|()| report));

        if self.evaluations_in_flight == 0 && self.state == EngineState::CheckingExposure {
            self.set_state(EngineState::Running);
        } else {
            self.publish_status();
        }
        let _ = done.reply.send(result);
    }

    fn store_exposures(&mut self, report: &MatchReport) -> Result<()> {
        let known: HashSet<String> = self
            .storage
            .load_exposures()?
            .into_iter()
            .map(|e| e.id)
            .collect();

        for event in &report.events {
            if self.settings.acknowledged_exposures.contains_key(&event.id) {
                continue;
            }
            self.storage.upsert_exposure(event)?;
            if !known.contains(&event.id) {
                info!(
                    epoch = event.epoch,
                    duration_secs = event.duration_secs,
                    risk_score = event.risk_score,
                    "Exposure detected"
                );
                self.notify(Notification::ExposureDetected {
                    event: event.clone(),
                });
            }
        }

        self.settings.last_evaluation = Some(self.clock.now());
        self.storage.save_settings(&self.settings)?;
        Ok(())
    }

    fn exposures(&self) -> Result<Vec<ExposureEvent>> {
        let mut events = self.storage.load_exposures()?;
        events.sort_by(|a, b| a.epoch.cmp(&b.epoch).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    fn acknowledge(&mut self, id: &str) -> Result<bool> {
        let Some(event) = self.storage.load_exposures()?.into_iter().find(|e| e.id == id) else {
            return Ok(false);
        };
        self.storage.delete_exposure(id)?;
        self.settings
            .acknowledged_exposures
            .insert(event.id.clone(), event.epoch);
        self.storage.save_settings(&self.settings)?;
        info!(id, epoch = event.epoch, "Exposure acknowledged");
        self.publish_status();
        Ok(true)
    }

    // ─── diagnosis and data ─────────────────────────────────────────────

    fn report_infected(&mut self, onset: DateTime<Utc>) -> Result<Vec<PublishedKey>> {
        let now = self.clock.now();
        let onset = onset.min(now);
        let protocol = &self.config.protocol;
        let first = protocol.epoch_at(onset);
        let last = protocol.epoch_at(now);

        self.keys.current_key(last)?;
        let published: Vec<PublishedKey> = self
            .keys
            .export_diagnosis_keys(first..=last)
            .iter()
            .map(|k| k.to_published())
            .collect();

        self.settings.infected_since = Some(onset);
        self.storage.save_settings(&self.settings)?;
        info!(first_epoch = first, last_epoch = last, keys = published.len(), "Diagnosis reported");
        self.publish_status();
        Ok(published)
    }

    fn clear_data(&mut self) -> Result<()> {
        if self.state != EngineState::Stopped {
            return Err(EngineError::EngineNotStopped { state: self.state });
        }
        self.storage.clear()?;
        self.keys.reset();
        self.contacts.reset();
        self.settings = EngineSettings::default();
        self.errors.clear();
        info!("All tracing data cleared");
        self.publish_status();
        Ok(())
    }

    /// Drop everything older than the retention window
    fn sweep(&mut self) -> proxi_core::Result<PruneSummary> {
        let oldest_epoch = self
            .config
            .protocol
            .epoch_at(self.clock.now() - self.config.protocol.retention());

        if let Err(e) = self.contacts.flush() {
            warn!(error = %e, "Failed to persist contacts before sweep");
        }
        let summary = PruneSummary {
            keys: self.keys.prune()?,
            contacts: self.contacts.prune_expired()?,
            exposures: self.storage.delete_exposures_before(oldest_epoch)?,
        };
        if self.settings.prune_acknowledged(oldest_epoch) > 0 {
            self.storage.save_settings(&self.settings)?;
        }
        if summary != PruneSummary::default() {
            info!(
                keys = summary.keys,
                contacts = summary.contacts,
                exposures = summary.exposures,
                "Retention sweep"
            );
        }
        Ok(summary)
    }

    // ─── status ─────────────────────────────────────────────────────────

    fn save_settings(&self) {
        if let Err(e) = self.storage.save_settings(&self.settings) {
            warn!(error = %e, "Failed to persist engine settings");
        }
    }

    fn record_failure(&mut self, error: &ProxiError) {
        if let Some(state) = ErrorState::from_error(error) {
            if !self.errors.contains(&state) {
                self.errors.push(state);
            }
        }
        self.notify(Notification::Fault {
            error: error.to_error_response().error,
        });
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "Engine state changed");
            self.state = state;
            self.notify(Notification::StateChanged { state });
        }
        self.publish_status();
    }

    fn notify(&self, notification: Notification) {
        // no subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn publish_status(&self) {
        let exposures = match self.storage.load_exposures() {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Could not load exposures for status");
                Vec::new()
            }
        };
        let mut exposure_epochs: Vec<u32> = exposures.iter().map(|e| e.epoch).collect();
        exposure_epochs.sort_unstable();
        exposure_epochs.dedup();

        let infection_status = if self.settings.infected_since.is_some() {
            InfectionStatus::Infected
        } else if !exposure_epochs.is_empty() {
            InfectionStatus::Exposed
        } else {
            InfectionStatus::Healthy
        };
        let duties = self.session.as_ref().map(|s| s.duties());

        self.status.send_replace(EngineStatus {
            state: self.state,
            advertising: duties.is_some_and(|d| d.advertise),
            receiving: duties.is_some_and(|d| d.receive),
            session_id: self.session.as_ref().map(|s| s.id()),
            current_interval: self.rotator.current().map(|c| c.interval),
            contact_count: self.contacts.len(),
            last_evaluation: self.settings.last_evaluation,
            infection_status,
            exposure_epochs,
            errors: self.errors.clone(),
        });
    }
}
