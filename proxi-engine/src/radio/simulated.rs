//! In-process radio for tests and simulations
//!
//! Every [`SimulatedRadio`] created from one [`SimulatedAir`] shares a tokio
//! broadcast channel. Advertisers publish their identifier every
//! `advertise_period`; scanners hear everything except their own adverts,
//! with an RSSI computed from the configured distance between the two
//! devices. Faults are injected by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use proxi_core::{RollingProximityIdentifier, SignalModel, SignalSample};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Observation, RadioDriver, RadioFault, ScanStream};

const AIR_CAPACITY: usize = 1024;
const SCAN_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Advertisement {
    from: Uuid,
    identifier: RollingProximityIdentifier,
}

struct AirInner {
    channel: broadcast::Sender<Advertisement>,
    model: SignalModel,
    default_distance_m: f64,
    distances: RwLock<HashMap<(Uuid, Uuid), f64>>,
}

impl AirInner {
    fn link(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn rssi_between(&self, a: Uuid, b: Uuid) -> i16 {
        let distance = self
            .distances
            .read()
            .get(&Self::link(a, b))
            .copied()
            .unwrap_or(self.default_distance_m)
            .max(0.1);
        let loss = 10.0 * self.model.path_loss_exponent * distance.log10();
        (self.model.reference_tx_power_dbm - loss).round() as i16
    }
}

/// Shared medium connecting simulated radios
#[derive(Clone)]
pub struct SimulatedAir {
    inner: Arc<AirInner>,
}

impl SimulatedAir {
    pub fn new(model: SignalModel) -> Self {
        Self::with_default_distance(model, 1.0)
    }

    /// Devices without an explicit distance are `meters` apart
    pub fn with_default_distance(model: SignalModel, meters: f64) -> Self {
        let (channel, _) = broadcast::channel(AIR_CAPACITY);
        Self {
            inner: Arc::new(AirInner {
                channel,
                model,
                default_distance_m: meters,
                distances: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// A new device on this air
    pub fn radio(&self) -> SimulatedRadio {
        SimulatedRadio::new(Arc::clone(&self.inner))
    }

    pub fn set_distance(&self, a: &SimulatedRadio, b: &SimulatedRadio, meters: f64) {
        self.inner
            .distances
            .write()
            .insert(AirInner::link(a.id, b.id), meters);
    }
}

struct Advertiser {
    payload: watch::Sender<RollingProximityIdentifier>,
    task: JoinHandle<()>,
}

struct Scanner {
    results: mpsc::Sender<Result<Observation, RadioFault>>,
    task: JoinHandle<()>,
}

/// One simulated device
pub struct SimulatedRadio {
    id: Uuid,
    air: Arc<AirInner>,
    advertise_period: Duration,
    denial: watch::Sender<Option<String>>,
    pending_faults: AtomicU32,
    advertiser: Mutex<Option<Advertiser>>,
    scanner: Mutex<Option<Scanner>>,
    advertise_calls: AtomicUsize,
    scan_starts: AtomicUsize,
}

impl SimulatedRadio {
    fn new(air: Arc<AirInner>) -> Self {
        let (denial, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            air,
            advertise_period: Duration::from_secs(4),
            denial,
            pending_faults: AtomicU32::new(0),
            advertiser: Mutex::new(None),
            scanner: Mutex::new(None),
            advertise_calls: AtomicUsize::new(0),
            scan_starts: AtomicUsize::new(0),
        }
    }

    pub fn with_advertise_period(mut self, period: Duration) -> Self {
        self.advertise_period = period;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Revoke the radio capability; active scans end with `Denied`
    pub fn deny(&self, reason: &str) {
        self.denial.send_replace(Some(reason.to_string()));
    }

    /// Grant the capability again
    pub fn allow(&self) {
        self.denial.send_replace(None);
    }

    /// Make the next `count` driver calls fail with a transient fault
    pub fn fail_next(&self, count: u32) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    /// Push a transient fault into the active scan stream
    pub fn interrupt_scan(&self) -> bool {
        match self.scanner.lock().as_ref() {
            Some(scanner) => scanner
                .results
                .try_send(Err(RadioFault::Transient("scan interrupted".to_string())))
                .is_ok(),
            None => false,
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertiser.lock().is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.lock().is_some()
    }

    /// Identifier currently on air, if advertising
    pub fn advertised(&self) -> Option<RollingProximityIdentifier> {
        self.advertiser.lock().as_ref().map(|a| *a.payload.borrow())
    }

    pub fn advertise_calls(&self) -> usize {
        self.advertise_calls.load(Ordering::SeqCst)
    }

    pub fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), RadioFault> {
        if let Some(reason) = self.denial.borrow().clone() {
            return Err(RadioFault::Denied(reason));
        }
        let took_fault = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took_fault {
            return Err(RadioFault::Transient("injected fault".to_string()));
        }
        Ok(())
    }

    fn spawn_advertiser(&self, identifier: RollingProximityIdentifier) -> Advertiser {
        let (payload, current) = watch::channel(identifier);
        let air = Arc::clone(&self.air);
        let from = self.id;
        let period = self.advertise_period;
        let denial = self.denial.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if denial.borrow().is_some() {
                    continue;
                }
                let identifier = *current.borrow();
                // no receivers is fine
                let _ = air.channel.send(Advertisement { from, identifier });
            }
        });
        Advertiser { payload, task }
    }

    fn spawn_scanner(&self) -> (Scanner, ScanStream) {
        let (results, stream) = mpsc::channel(SCAN_BUFFER);
        let mut air_rx = self.air.channel.subscribe();
        let mut denial = self.denial.subscribe();
        let air = Arc::clone(&self.air);
        let me = self.id;
        let sender = results.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = denial.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let reason = denial.borrow_and_update().clone();
                        if let Some(reason) = reason {
                            let _ = sender.send(Err(RadioFault::Denied(reason))).await;
                            break;
                        }
                    }
                    received = air_rx.recv() => match received {
                        Ok(ad) if ad.from == me => {}
                        Ok(ad) => {
                            let observation = Observation {
                                identifier: ad.identifier,
                                sample: SignalSample::new(air.rssi_between(me, ad.from)),
                            };
                            if sender.send(Ok(observation)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Simulated scanner lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        (Scanner { results, task }, stream)
    }
}

#[async_trait]
impl RadioDriver for SimulatedRadio {
    async fn check_capability(&self) -> Result<(), RadioFault> {
        self.gate()
    }

    async fn start_advertising(&self, identifier: RollingProximityIdentifier) -> Result<(), RadioFault> {
        self.gate()?;
        self.advertise_calls.fetch_add(1, Ordering::SeqCst);

        let mut advertiser = self.advertiser.lock();
        match advertiser.as_ref() {
            Some(active) => {
                active.payload.send_replace(identifier);
            }
            None => {
                *advertiser = Some(self.spawn_advertiser(identifier));
                debug!(device = %self.id, "Simulated advertising started");
            }
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioFault> {
        if let Some(active) = self.advertiser.lock().take() {
            active.task.abort();
        }
        Ok(())
    }

    async fn start_scan(&self) -> Result<ScanStream, RadioFault> {
        self.gate()?;
        self.scan_starts.fetch_add(1, Ordering::SeqCst);

        let (scanner, stream) = self.spawn_scanner();
        if let Some(previous) = self.scanner.lock().replace(scanner) {
            previous.task.abort();
        }
        Ok(stream)
    }

    async fn stop_scan(&self) -> Result<(), RadioFault> {
        if let Some(active) = self.scanner.lock().take() {
            active.task.abort();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

impl Drop for SimulatedRadio {
    fn drop(&mut self) {
        if let Some(active) = self.advertiser.get_mut().take() {
            active.task.abort();
        }
        if let Some(active) = self.scanner.get_mut().take() {
            active.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpi(byte: u8) -> RollingProximityIdentifier {
        RollingProximityIdentifier::from_bytes([byte; 16])
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_hears_peer_at_distance() {
        let air = SimulatedAir::new(SignalModel::default());
        let a = air.radio();
        let b = air.radio();
        air.set_distance(&a, &b, 2.0);

        let mut stream = b.start_scan().await.unwrap();
        a.start_advertising(rpi(1)).await.unwrap();

        let observation = stream.recv().await.unwrap().unwrap();
        assert_eq!(observation.identifier, rpi(1));
        assert_eq!(observation.sample.rssi_dbm, -65);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_ignores_own_adverts() {
        let air = SimulatedAir::new(SignalModel::default());
        let a = air.radio();
        let b = air.radio();

        let mut stream = a.start_scan().await.unwrap();
        a.start_advertising(rpi(1)).await.unwrap();
        b.start_advertising(rpi(2)).await.unwrap();

        for _ in 0..3 {
            let observation = stream.recv().await.unwrap().unwrap();
            assert_eq!(observation.identifier, rpi(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_swap_keeps_advertising() {
        let air = SimulatedAir::new(SignalModel::default());
        let a = air.radio();

        a.start_advertising(rpi(1)).await.unwrap();
        a.start_advertising(rpi(2)).await.unwrap();
        assert!(a.is_advertising());
        assert_eq!(a.advertised(), Some(rpi(2)));
        assert_eq!(a.advertise_calls(), 2);

        a.stop_advertising().await.unwrap();
        assert!(!a.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_faults() {
        let air = SimulatedAir::new(SignalModel::default());
        let a = air.radio();

        a.fail_next(2);
        assert!(matches!(a.check_capability().await, Err(RadioFault::Transient(_))));
        assert!(matches!(a.start_scan().await, Err(RadioFault::Transient(_))));
        assert!(a.check_capability().await.is_ok());

        let mut stream = a.start_scan().await.unwrap();
        assert!(a.interrupt_scan());
        assert!(matches!(stream.recv().await, Some(Err(RadioFault::Transient(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_ends_scan() {
        let air = SimulatedAir::new(SignalModel::default());
        let a = air.radio();

        let mut stream = a.start_scan().await.unwrap();
        a.deny("location permission revoked");

        assert_eq!(
            stream.recv().await,
            Some(Err(RadioFault::Denied("location permission revoked".to_string())))
        );
        assert!(matches!(a.start_advertising(rpi(1)).await, Err(RadioFault::Denied(_))));

        a.allow();
        assert!(a.check_capability().await.is_ok());
    }
}
