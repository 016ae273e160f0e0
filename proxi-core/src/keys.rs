//! Per-epoch tracing keys
//!
//! [`KeyMaterial`] owns every tracing key the device has generated. A key is
//! created lazily the first time its epoch is requested, persisted through
//! the storage backend, and dropped once its epoch leaves the retention
//! window. Keys never leave this module except as diagnosis keys.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use proxi_crypto::{KeySource, OsKeySource, RollingProximityIdentifier, TracingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::matcher::DiagnosisKey;
use crate::storage::StorageBackend;

/// A tracing key as persisted, keyed by epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredKey {
    pub epoch: u32,
    pub key: TracingKey,
    pub created_at: DateTime<Utc>,
}

/// Generates, stores and exports the device's tracing keys
pub struct KeyMaterial {
    protocol: ProtocolConfig,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    source: Arc<dyn KeySource>,
    keys: RwLock<BTreeMap<u32, StoredKey>>,
}

impl KeyMaterial {
    /// Create key material, reloading any keys already in storage
    pub fn new(
        protocol: ProtocolConfig,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let keys: BTreeMap<u32, StoredKey> = storage
            .load_keys()?
            .into_iter()
            .map(|stored| (stored.epoch, stored))
            .collect();
        debug!(count = keys.len(), backend = storage.name(), "Loaded tracing keys");

        Ok(Self {
            protocol,
            storage,
            clock,
            source: Arc::new(OsKeySource),
            keys: RwLock::new(keys),
        })
    }

    /// Replace the random source (tests, hardware RNGs)
    pub fn with_key_source(mut self, source: Arc<dyn KeySource>) -> Self {
        self.source = source;
        self
    }

    /// The key for `epoch`, generating and persisting it on first use
    ///
    /// Idempotent within an epoch. Fails with `KeyGeneration` when the random
    /// source is unavailable.
    pub fn current_key(&self, epoch: u32) -> Result<TracingKey> {
        if let Some(stored) = self.keys.read().get(&epoch) {
            return Ok(stored.key.clone());
        }

        let mut keys = self.keys.write();
        if let Some(stored) = keys.get(&epoch) {
            return Ok(stored.key.clone());
        }

        let key = TracingKey::generate(self.source.as_ref())?;
        let stored = StoredKey {
            epoch,
            key: key.clone(),
            created_at: self.clock.now(),
        };
        self.storage.put_key(&stored)?;
        keys.insert(epoch, stored);
        info!(epoch, "Generated tracing key");

        Ok(key)
    }

    /// Key for the epoch containing the clock's current time
    pub fn key_for_now(&self) -> Result<(u32, TracingKey)> {
        let epoch = self.protocol.epoch_at(self.clock.now());
        Ok((epoch, self.current_key(epoch)?))
    }

    /// Derive the identifier `key` broadcasts during `interval`
    pub fn derive_rpi(key: &TracingKey, interval: u32) -> RollingProximityIdentifier {
        proxi_crypto::derive_rpi(key, interval)
    }

    /// Export stored keys for the given epochs as diagnosis keys
    ///
    /// Epochs without a key are skipped. The key of the epoch still in
    /// progress is exported with its period truncated to the intervals
    /// already broadcast.
    pub fn export_diagnosis_keys(&self, epochs: RangeInclusive<u32>) -> Vec<DiagnosisKey> {
        let now_interval = self.protocol.interval_at(self.clock.now());
        let per_epoch = self.protocol.intervals_per_epoch;

        self.keys
            .read()
            .range(epochs)
            .filter_map(|(&epoch, stored)| {
                let start = self.protocol.epoch_start_interval(epoch);
                if start > now_interval {
                    return None;
                }
                let elapsed = now_interval - start + 1;
                Some(DiagnosisKey {
                    key: stored.key.clone(),
                    rolling_start_interval: start,
                    rolling_period: elapsed.min(per_epoch),
                })
            })
            .collect()
    }

    /// Drop keys whose epoch ended before the retention window
    pub fn prune(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.protocol.retention();
        let oldest_kept = self.protocol.epoch_at(cutoff);

        let mut keys = self.keys.write();
        let retained = keys.split_off(&oldest_kept);
        let removed = keys.len();
        *keys = retained;
        drop(keys);

        if removed > 0 {
            self.storage.delete_keys_before(oldest_kept)?;
            info!(removed, oldest_kept, "Pruned tracing keys");
        }
        Ok(removed)
    }

    /// Forget all keys held in memory; storage is cleared by the caller
    pub fn reset(&self) {
        self.keys.write().clear();
    }

    pub fn epochs(&self) -> Vec<u32> {
        self.keys.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{FileStorage, InMemoryStorage};
    use chrono::Duration;
    use proxi_crypto::CryptoError;

    struct DeadSource;

    impl KeySource for DeadSource {
        fn fill(&self, _dest: &mut [u8]) -> proxi_crypto::Result<()> {
            Err(CryptoError::RandomSourceUnavailable {
                reason: "no entropy".to_string(),
            })
        }
    }

    fn clock_at_interval(interval: u32) -> Arc<ManualClock> {
        let protocol = ProtocolConfig::default();
        Arc::new(ManualClock::new(protocol.interval_start(interval)))
    }

    fn material(clock: Arc<ManualClock>) -> KeyMaterial {
        KeyMaterial::new(
            ProtocolConfig::default(),
            Arc::new(InMemoryStorage::new()),
            clock,
        )
        .unwrap()
    }

    #[test]
    fn test_current_key_is_idempotent() {
        let keys = material(clock_at_interval(100));
        let a = keys.current_key(0).unwrap();
        let b = keys.current_key(0).unwrap();
        let c = keys.current_key(1).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_key_generation_failure() {
        let keys = material(clock_at_interval(100)).with_key_source(Arc::new(DeadSource));
        let err = keys.current_key(0).unwrap_err();
        assert_eq!(err.error_code(), "KEY_GENERATION_FAILED");
        assert!(err.is_fatal());
        assert!(keys.is_empty());
    }

    #[test]
    fn test_keys_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock_at_interval(100);

        let first = {
            let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
            let keys = KeyMaterial::new(ProtocolConfig::default(), storage, clock.clone()).unwrap();
            keys.current_key(0).unwrap()
        };

        let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
        let keys = KeyMaterial::new(ProtocolConfig::default(), storage, clock).unwrap();
        assert_eq!(keys.current_key(0).unwrap(), first);
    }

    #[test]
    fn test_export_truncates_current_epoch() {
        let protocol = ProtocolConfig::default();
        // 10 intervals into epoch 3
        let clock = clock_at_interval(protocol.epoch_start_interval(3) + 9);
        let keys = material(clock);
        for epoch in 1..=3 {
            keys.current_key(epoch).unwrap();
        }

        let exported = keys.export_diagnosis_keys(2..=3);
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].rolling_start_interval, 288);
        assert_eq!(exported[0].rolling_period, 144);
        assert_eq!(exported[1].rolling_start_interval, 432);
        assert_eq!(exported[1].rolling_period, 10);
    }

    #[test]
    fn test_prune_drops_expired_epochs() {
        let clock = clock_at_interval(0);
        let keys = material(clock.clone());
        keys.current_key(0).unwrap();
        keys.current_key(1).unwrap();

        clock.advance(Duration::days(15));
        keys.current_key(15).unwrap();

        assert_eq!(keys.prune().unwrap(), 1);
        assert_eq!(keys.epochs(), vec![1, 15]);
        assert_eq!(keys.prune().unwrap(), 0);
    }

    #[test]
    fn test_derive_matches_crypto_crate() {
        let key = TracingKey::from_bytes([5; 16]);
        assert_eq!(
            KeyMaterial::derive_rpi(&key, 100),
            proxi_crypto::derive_rpi(&key, 100)
        );
    }
}
