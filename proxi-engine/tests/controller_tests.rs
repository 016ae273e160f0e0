//! Controller lifecycle, two-device encounters and persistence
//!
//! All tests run on paused tokio time; `RuntimeClock` moves wall time with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use proxi_core::{
    ContactKey, ContactRecord, EngineConfig, EngineSettings, ExposureEvent, FileStorage,
    InMemoryStorage, ProxiError, PublishedKey, StorageBackend, StoredKey,
};
use proxi_engine::{
    EngineBuilder, EngineHandle, EngineState, ErrorState, InfectionStatus, Notification,
    PruneSummary, RuntimeClock, SimulatedAir, SimulatedRadio,
};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const EPOCH: u32 = 19_500;

/// 30 s into interval 100 of `EPOCH`
fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(EPOCH) * 86_400 + 100 * 600 + 30, 0).unwrap()
}

struct Device {
    radio: Arc<SimulatedRadio>,
    engine: EngineHandle,
}

async fn device(air: &SimulatedAir, storage: Arc<dyn StorageBackend>, clock: &Arc<RuntimeClock>) -> Device {
    let radio = Arc::new(air.radio());
    let engine = EngineBuilder::new(radio.clone())
        .with_config(EngineConfig::default())
        .with_storage(storage)
        .with_clock(clock.clone())
        .launch()
        .await
        .unwrap();
    Device { radio, engine }
}

async fn wait_for_state(engine: &EngineHandle, state: EngineState) {
    let mut updates = engine.watch_status();
    let reached = timeout(Duration::from_secs(600), updates.wait_for(|s| s.state == state)).await;
    assert!(matches!(reached, Ok(Ok(_))), "engine never reached {state}");
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        seen.push(notification);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn test_forty_minutes_at_two_meters_is_one_exposure() {
    let air = SimulatedAir::with_default_distance(Default::default(), 2.0);
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;
    let b = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    a.engine.start(true, true).await.unwrap();
    b.engine.start(true, true).await.unwrap();
    sleep(Duration::from_secs(40 * 60)).await;

    let keys = a
        .engine
        .report_infected(base() - chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(a.engine.status().infection_status, InfectionStatus::Infected);

    let mut notifications = b.engine.subscribe();
    let report = b.engine.evaluate(keys.clone()).await.unwrap();
    assert!(report.rejected.is_empty());
    assert_eq!(report.events.len(), 1);

    let event = &report.events[0];
    assert_eq!(event.epoch, EPOCH);
    assert!(event.duration_secs >= 30 * 60, "duration {}", event.duration_secs);
    assert!(event.matched_intervals >= 4);
    assert!((event.median_distance_m - 2.0).abs() < 0.5);
    assert!(event.risk_score > 0.0 && event.risk_score <= 1.0);

    let status = b.engine.status();
    assert_eq!(status.state, EngineState::Running);
    assert_eq!(status.infection_status, InfectionStatus::Exposed);
    assert_eq!(status.exposure_epochs, vec![EPOCH]);
    assert!(status.last_evaluation.is_some());

    let detected = drain(&mut notifications)
        .into_iter()
        .filter(|n| matches!(n, Notification::ExposureDetected { .. }))
        .count();
    assert_eq!(detected, 1);

    // acknowledged events stay dismissed across re-evaluation
    assert!(b.engine.acknowledge(&event.id).await.unwrap());
    assert!(!b.engine.acknowledge(&event.id).await.unwrap());
    let again = b.engine.evaluate(keys).await.unwrap();
    assert_eq!(again.events.len(), 1);
    assert!(b.engine.exposures().await.unwrap().is_empty());
    assert_eq!(b.engine.status().infection_status, InfectionStatus::Healthy);
    assert!(drain(&mut notifications)
        .iter()
        .all(|n| !matches!(n, Notification::ExposureDetected { .. })));

    a.engine.shutdown().await.unwrap();
    b.engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_identifier_rotates_at_interval_boundary() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    let status = a.engine.start(true, false).await.unwrap();
    assert_eq!(status.current_interval, Some(EPOCH * 144 + 100));
    let first = a.radio.advertised().unwrap();

    sleep(Duration::from_secs(600)).await;

    assert_eq!(a.engine.status().current_interval, Some(EPOCH * 144 + 101));
    let second = a.radio.advertised().unwrap();
    assert_ne!(first, second);
    assert!(a.radio.is_advertising());
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_a_no_op() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    let first = a.engine.start(true, true).await.unwrap();
    let calls = a.radio.advertise_calls();
    let second = a.engine.start(true, true).await.unwrap();

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(second.state, EngineState::Running);
    assert_eq!(a.radio.advertise_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_start_without_duties_is_rejected() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    let err = a.engine.start(false, false).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CONFIG");
    assert_eq!(a.engine.status().state, EngineState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_denied_radio_fails_start() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;
    let mut notifications = a.engine.subscribe();

    a.radio.deny("bluetooth off");
    let err = a.engine.start(true, true).await.unwrap_err();

    assert_eq!(err.error_code(), "RADIO_UNAVAILABLE");
    let status = a.engine.status();
    assert_eq!(status.state, EngineState::Stopped);
    assert_eq!(status.errors, vec![ErrorState::RadioUnavailable]);
    assert_eq!(status.current_interval, None);
    assert!(!a.radio.is_advertising());

    let faults = drain(&mut notifications)
        .into_iter()
        .filter(|n| matches!(n, Notification::Fault { .. }))
        .count();
    assert_eq!(faults, 1);

    // granting the capability again lets a new start succeed
    a.radio.allow();
    let status = a.engine.start(true, true).await.unwrap();
    assert_eq!(status.state, EngineState::Running);
    assert!(status.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_faults_are_retried() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    a.radio.fail_next(3);
    let status = a.engine.start(true, true).await.unwrap();
    assert_eq!(status.state, EngineState::Running);
    assert!(status.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persistent_faults_exhaust_retries() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    a.radio.fail_next(100);
    let err = a.engine.start(true, true).await.unwrap_err();

    assert_eq!(err.error_code(), "RADIO_RETRIES_EXHAUSTED");
    let status = a.engine.status();
    assert_eq!(status.state, EngineState::Stopped);
    assert_eq!(status.errors, vec![ErrorState::RadioRetriesExhausted]);
}

#[tokio::test(start_paused = true)]
async fn test_revoked_capability_stops_engine_once() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let storage = Arc::new(InMemoryStorage::new());
    let a = device(&air, storage.clone(), &clock).await;

    a.engine.start(true, true).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    let mut notifications = a.engine.subscribe();

    a.radio.deny("permission revoked");
    wait_for_state(&a.engine, EngineState::Stopped).await;
    sleep(Duration::from_secs(300)).await;

    let seen = drain(&mut notifications);
    let faults = seen.iter().filter(|n| matches!(n, Notification::Fault { .. })).count();
    assert_eq!(faults, 1);
    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::StateChanged { state: EngineState::Stopped })));

    let status = a.engine.status();
    assert_eq!(status.errors, vec![ErrorState::RadioUnavailable]);
    assert!(!status.advertising && !status.receiving);
    assert!(!a.radio.is_advertising());
    assert!(!a.radio.is_scanning());

    // the user never asked to stop, so tracing stays enabled for the next launch
    assert!(storage.load_settings().unwrap().tracing_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_stop_keeps_contacts_and_releases_radio() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let storage = Arc::new(InMemoryStorage::new());
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;
    let b = device(&air, storage.clone(), &clock).await;

    a.engine.start(true, false).await.unwrap();
    b.engine.start(false, true).await.unwrap();
    sleep(Duration::from_secs(300)).await;

    let before = b.engine.status().contact_count;
    assert!(before > 0);

    let status = b.engine.stop().await.unwrap();
    assert_eq!(status.state, EngineState::Stopped);
    assert_eq!(status.contact_count, before);
    assert!(!b.radio.is_scanning());
    assert!(!storage.load_settings().unwrap().tracing_enabled());
    assert_eq!(storage.load_contacts().unwrap().len(), before);

    sleep(Duration::from_secs(300)).await;
    assert_eq!(b.engine.status().contact_count, before);
}

#[tokio::test(start_paused = true)]
async fn test_receive_only_still_owns_a_key() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    let status = a.engine.start(false, true).await.unwrap();
    assert!(!status.advertising);
    assert!(status.receiving);
    assert_eq!(status.current_interval, None);
    assert!(!a.radio.is_advertising());

    let keys = a.engine.report_infected(base()).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].rolling_start_interval, EPOCH * 144);
    assert_eq!(keys[0].rolling_period, 101);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_keys_are_reported_not_fatal() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    let keys = vec![
        PublishedKey {
            key_data: "not hex".to_string(),
            rolling_start_interval: EPOCH * 144,
            rolling_period: 144,
        },
        PublishedKey {
            key_data: "00".repeat(16),
            rolling_start_interval: EPOCH * 144,
            rolling_period: 144,
        },
    ];
    let report = a.engine.evaluate(keys).await.unwrap();

    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].index, 0);
    assert!(report.events.is_empty());
    // evaluation while stopped leaves the engine stopped
    let status = a.engine.status();
    assert_eq!(status.state, EngineState::Stopped);
    assert!(status.last_evaluation.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_clear_data_requires_stopped_engine() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;
    let b = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    a.engine.start(true, true).await.unwrap();
    b.engine.start(true, true).await.unwrap();
    sleep(Duration::from_secs(120)).await;
    let before = a.engine.report_infected(base()).await.unwrap();

    let err = a.engine.clear_data().await.unwrap_err();
    assert_eq!(err.error_code(), "ENGINE_NOT_STOPPED");

    a.engine.stop().await.unwrap();
    a.engine.clear_data().await.unwrap();

    let status = a.engine.status();
    assert_eq!(status.contact_count, 0);
    assert_eq!(status.infection_status, InfectionStatus::Healthy);
    // a fresh key replaces the wiped one
    let after = a.engine.report_infected(base()).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_ne!(after[0].key_data, before[0].key_data);
}

#[tokio::test(start_paused = true)]
async fn test_tracing_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));

    let first = device(&air, Arc::new(FileStorage::new(dir.path()).unwrap()), &clock).await;
    first.engine.start(true, true).await.unwrap();
    let advertised = first.radio.advertised();
    first.engine.shutdown().await.unwrap();
    assert!(!first.radio.is_advertising());

    // same interval, same persisted key, same identifier
    let second = device(&air, Arc::new(FileStorage::new(dir.path()).unwrap()), &clock).await;
    let status = second.engine.status();
    assert_eq!(status.state, EngineState::Running);
    assert!(status.advertising && status.receiving);
    assert_eq!(second.radio.advertised(), advertised);

    second.engine.stop().await.unwrap();
    second.engine.shutdown().await.unwrap();

    let third = device(&air, Arc::new(FileStorage::new(dir.path()).unwrap()), &clock).await;
    assert_eq!(third.engine.status().state, EngineState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_history_expires_while_stopped() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;
    let b = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    a.engine.start(true, false).await.unwrap();
    b.engine.start(false, true).await.unwrap();
    sleep(Duration::from_secs(300)).await;
    a.engine.stop().await.unwrap();
    b.engine.stop().await.unwrap();
    assert!(b.engine.status().contact_count > 0);

    // hourly sweeps drop contacts once they leave the 14 day window
    sleep(Duration::from_secs(15 * 86_400)).await;
    assert_eq!(b.engine.status().contact_count, 0);
    assert_eq!(b.engine.prune().await.unwrap(), PruneSummary::default());
}

#[tokio::test(start_paused = true)]
async fn test_handle_fails_after_shutdown() {
    let air = SimulatedAir::new(Default::default());
    let clock = Arc::new(RuntimeClock::starting_at(base()));
    let a = device(&air, Arc::new(InMemoryStorage::new()), &clock).await;

    a.engine.start(true, true).await.unwrap();
    a.engine.shutdown().await.unwrap();

    assert_eq!(a.engine.status().state, EngineState::Stopped);
    let err = a.engine.start(true, true).await.unwrap_err();
    assert_eq!(err.error_code(), "ENGINE_SHUT_DOWN");
}

/// In-memory storage that refuses to persist keys for later epochs while `full` is set
struct FullDisk {
    inner: InMemoryStorage,
    from_epoch: u32,
    full: AtomicBool,
}

impl StorageBackend for FullDisk {
    fn put_key(&self, key: &StoredKey) -> proxi_core::Result<()> {
        if key.epoch >= self.from_epoch && self.full.load(Ordering::SeqCst) {
            return Err(ProxiError::Io {
                message: "disk full".to_string(),
            });
        }
        self.inner.put_key(key)
    }
    fn load_keys(&self) -> proxi_core::Result<Vec<StoredKey>> {
        self.inner.load_keys()
    }
    fn delete_keys_before(&self, epoch: u32) -> proxi_core::Result<usize> {
        self.inner.delete_keys_before(epoch)
    }
    fn upsert_contact(&self, record: &ContactRecord) -> proxi_core::Result<()> {
        self.inner.upsert_contact(record)
    }
    fn delete_contact(&self, key: &ContactKey) -> proxi_core::Result<bool> {
        self.inner.delete_contact(key)
    }
    fn load_contacts(&self) -> proxi_core::Result<Vec<ContactRecord>> {
        self.inner.load_contacts()
    }
    fn delete_contacts_before(&self, cutoff: DateTime<Utc>) -> proxi_core::Result<usize> {
        self.inner.delete_contacts_before(cutoff)
    }
    fn upsert_exposure(&self, event: &ExposureEvent) -> proxi_core::Result<()> {
        self.inner.upsert_exposure(event)
    }
    fn delete_exposure(&self, id: &str) -> proxi_core::Result<bool> {
        self.inner.delete_exposure(id)
    }
    fn load_exposures(&self) -> proxi_core::Result<Vec<ExposureEvent>> {
        self.inner.load_exposures()
    }
    fn delete_exposures_before(&self, epoch: u32) -> proxi_core::Result<usize> {
        self.inner.delete_exposures_before(epoch)
    }
    fn load_settings(&self) -> proxi_core::Result<EngineSettings> {
        self.inner.load_settings()
    }
    fn save_settings(&self, settings: &EngineSettings) -> proxi_core::Result<()> {
        self.inner.save_settings(settings)
    }
    fn clear(&self) -> proxi_core::Result<()> {
        self.inner.clear()
    }
    fn health_check(&self) -> proxi_core::Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "full-disk"
    }
}

#[tokio::test(start_paused = true)]
async fn test_rotation_recovers_after_storage_failure() {
    let air = SimulatedAir::new(Default::default());
    // 30 s before the epoch rolls over
    let start = DateTime::from_timestamp(i64::from(EPOCH) * 86_400 + 143 * 600 + 30, 0).unwrap();
    let clock = Arc::new(RuntimeClock::starting_at(start));
    let storage = Arc::new(FullDisk {
        inner: InMemoryStorage::new(),
        from_epoch: EPOCH + 1,
        full: AtomicBool::new(true),
    });
    let a = device(&air, storage.clone(), &clock).await;

    let status = a.engine.start(true, true).await.unwrap();
    assert_eq!(status.current_interval, Some(EPOCH * 144 + 143));
    let stale = a.radio.advertised();

    // the next epoch's key cannot be persisted: the failure is visible, not silent
    sleep(Duration::from_secs(600)).await;
    let status = a.engine.status();
    assert_eq!(status.state, EngineState::Running);
    assert_eq!(status.errors, vec![ErrorState::Storage]);
    assert_eq!(status.current_interval, Some(EPOCH * 144 + 143));

    storage.full.store(false, Ordering::SeqCst);
    sleep(Duration::from_secs(60)).await;
    let status = a.engine.status();
    assert!(status.errors.is_empty());
    assert_eq!(status.current_interval, Some((EPOCH + 1) * 144));
    assert_ne!(a.radio.advertised(), stale);

    // and keeps rotating on every boundary afterwards
    sleep(Duration::from_secs(6 * 3600)).await;
    let status = a.engine.status();
    assert_eq!(status.state, EngineState::Running);
    assert_eq!(status.current_interval, Some((EPOCH + 1) * 144 + 36));
    assert!(a.radio.is_advertising());

    a.engine.shutdown().await.unwrap();
}
