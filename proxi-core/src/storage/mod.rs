//! Pluggable storage backend
//!
//! Durable state is small and table-shaped: tracing keys by epoch, contact
//! records by [`ContactKey`], exposure events by id, and one
//! [`EngineSettings`] document. Backends only store and load; coalescing,
//! expiry and ordering rules live in the owning modules.
//!
//! # Example
//!
//! ```rust
//! use proxi_core::storage::{InMemoryStorage, StorageBackend};
//!
//! let storage = InMemoryStorage::new();
//! assert!(storage.load_keys().unwrap().is_empty());
//! assert_eq!(storage.name(), "in-memory");
//! ```

mod file;

pub use file::FileStorage;

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contacts::{ContactKey, ContactRecord};
use crate::error::{ProxiError, Result};
use crate::keys::StoredKey;
use crate::matcher::ExposureEvent;

/// Host-visible engine state that must survive restarts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub advertising_enabled: bool,

    #[serde(default)]
    pub receiving_enabled: bool,

    /// Set once the user reports a positive diagnosis
    #[serde(default)]
    pub infected_since: Option<DateTime<Utc>>,

    /// Completion time of the last matching pass
    #[serde(default)]
    pub last_evaluation: Option<DateTime<Utc>>,

    /// Exposure ids the user dismissed, with their epoch
    #[serde(default)]
    pub acknowledged_exposures: BTreeMap<String, u32>,
}

impl EngineSettings {
    /// True when tracing should resume after a restart
    pub fn tracing_enabled(&self) -> bool {
        self.advertising_enabled || self.receiving_enabled
    }

    /// Forget acknowledgements for epochs before `epoch`
    pub fn prune_acknowledged(&mut self, epoch: u32) -> usize {
        let before = self.acknowledged_exposures.len();
        self.acknowledged_exposures.retain(|_, e| *e >= epoch);
        before - self.acknowledged_exposures.len()
    }
}

/// Storage backend trait
///
/// All methods take `&self`; implementations provide their own locking.
pub trait StorageBackend: Send + Sync {
    /// Insert or replace the key for `key.epoch`
    fn put_key(&self, key: &StoredKey) -> Result<()>;

    fn load_keys(&self) -> Result<Vec<StoredKey>>;

    /// Delete keys of epochs strictly before `epoch`
    fn delete_keys_before(&self, epoch: u32) -> Result<usize>;

    /// Insert or replace a contact record by its key
    fn upsert_contact(&self, record: &ContactRecord) -> Result<()>;

    fn delete_contact(&self, key: &ContactKey) -> Result<bool>;

    fn load_contacts(&self) -> Result<Vec<ContactRecord>>;

    /// Delete contacts last seen strictly before `cutoff`
    fn delete_contacts_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Insert or replace an exposure event by id
    fn upsert_exposure(&self, event: &ExposureEvent) -> Result<()>;

    fn delete_exposure(&self, id: &str) -> Result<bool>;

    fn load_exposures(&self) -> Result<Vec<ExposureEvent>>;

    /// Delete exposures of epochs strictly before `epoch`
    fn delete_exposures_before(&self, epoch: u32) -> Result<usize>;

    fn load_settings(&self) -> Result<EngineSettings>;

    fn save_settings(&self, settings: &EngineSettings) -> Result<()>;

    /// Remove everything
    fn clear(&self) -> Result<()>;

    /// Check if backend is healthy
    fn health_check(&self) -> Result<()>;

    /// Backend name (for logging)
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct Tables {
    keys: BTreeMap<u32, StoredKey>,
    contacts: HashMap<ContactKey, ContactRecord>,
    exposures: BTreeMap<String, ExposureEvent>,
    settings: EngineSettings,
}

/// In-memory storage backend (default)
///
/// State is lost on restart. Thread-safe via RwLock.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contact_count(&self) -> usize {
        self.tables.read().map(|t| t.contacts.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| ProxiError::StorageLocked)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| ProxiError::StorageLocked)
    }
}

impl StorageBackend for InMemoryStorage {
    fn put_key(&self, key: &StoredKey) -> Result<()> {
        self.write()?.keys.insert(key.epoch, key.clone());
        Ok(())
    }

    fn load_keys(&self) -> Result<Vec<StoredKey>> {
        Ok(self.read()?.keys.values().cloned().collect())
    }

    fn delete_keys_before(&self, epoch: u32) -> Result<usize> {
        let mut tables = self.write()?;
        let retained = tables.keys.split_off(&epoch);
        let removed = tables.keys.len();
        tables.keys = retained;
        Ok(removed)
    }

    fn upsert_contact(&self, record: &ContactRecord) -> Result<()> {
        self.write()?.contacts.insert(record.key, record.clone());
        Ok(())
    }

    fn delete_contact(&self, key: &ContactKey) -> Result<bool> {
        Ok(self.write()?.contacts.remove(key).is_some())
    }

    fn load_contacts(&self) -> Result<Vec<ContactRecord>> {
        Ok(self.read()?.contacts.values().cloned().collect())
    }

    fn delete_contacts_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.write()?;
        let before = tables.contacts.len();
        tables.contacts.retain(|_, r| r.last_seen >= cutoff);
        Ok(before - tables.contacts.len())
    }

    fn upsert_exposure(&self, event: &ExposureEvent) -> Result<()> {
        self.write()?.exposures.insert(event.id.clone(), event.clone());
        Ok(())
    }

    fn delete_exposure(&self, id: &str) -> Result<bool> {
        Ok(self.write()?.exposures.remove(id).is_some())
    }

    fn load_exposures(&self) -> Result<Vec<ExposureEvent>> {
        Ok(self.read()?.exposures.values().cloned().collect())
    }

    fn delete_exposures_before(&self, epoch: u32) -> Result<usize> {
        let mut tables = self.write()?;
        let before = tables.exposures.len();
        tables.exposures.retain(|_, e| e.epoch >= epoch);
        Ok(before - tables.exposures.len())
    }

    fn load_settings(&self) -> Result<EngineSettings> {
        Ok(self.read()?.settings.clone())
    }

    fn save_settings(&self, settings: &EngineSettings) -> Result<()> {
        self.write()?.settings = settings.clone();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.write()? = Tables::default();
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

/// Null storage backend (discards everything)
///
/// Useful when persistence is handled elsewhere or not wanted at all.
#[derive(Debug, Default, Clone)]
pub struct NullStorage;

impl NullStorage {
    pub fn new() -> Self {
        Self
    }
}

impl StorageBackend for NullStorage {
    fn put_key(&self, _key: &StoredKey) -> Result<()> {
        Ok(())
    }

    fn load_keys(&self) -> Result<Vec<StoredKey>> {
        Ok(Vec::new())
    }

    fn delete_keys_before(&self, _epoch: u32) -> Result<usize> {
        Ok(0)
    }

    fn upsert_contact(&self, _record: &ContactRecord) -> Result<()> {
        Ok(())
    }

    fn delete_contact(&self, _key: &ContactKey) -> Result<bool> {
        Ok(false)
    }

    fn load_contacts(&self) -> Result<Vec<ContactRecord>> {
        Ok(Vec::new())
    }

    fn delete_contacts_before(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }

    fn upsert_exposure(&self, _event: &ExposureEvent) -> Result<()> {
        Ok(())
    }

    fn delete_exposure(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }

    fn load_exposures(&self) -> Result<Vec<ExposureEvent>> {
        Ok(Vec::new())
    }

    fn delete_exposures_before(&self, _epoch: u32) -> Result<usize> {
        Ok(0)
    }

    fn load_settings(&self) -> Result<EngineSettings> {
        Ok(EngineSettings::default())
    }

    fn save_settings(&self, _settings: &EngineSettings) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::contacts::Sighting;
    use proxi_crypto::{RollingProximityIdentifier, TracingKey};

    pub fn stored_key(epoch: u32) -> StoredKey {
        StoredKey {
            epoch,
            key: TracingKey::from_bytes([epoch as u8; 16]),
            created_at: DateTime::<Utc>::from_timestamp(i64::from(epoch) * 86_400, 0).unwrap(),
        }
    }

    pub fn contact(byte: u8, at_secs: i64) -> ContactRecord {
        let at = DateTime::<Utc>::from_timestamp(at_secs, 0).unwrap();
        ContactRecord {
            key: ContactKey {
                bucket: (at_secs / 600) as u32,
                identifier: RollingProximityIdentifier::from_bytes([byte; 16]),
                opened_at_ms: at.timestamp_millis(),
            },
            first_seen: at,
            last_seen: at,
            sample_count: 1,
            mean_distance_m: 2.0,
            min_distance_m: 2.0,
            sightings: vec![Sighting {
                at,
                attenuation_db: 6.0,
                distance_m: 2.0,
            }],
        }
    }

    pub fn exposure(id: &str, epoch: u32) -> ExposureEvent {
        let at = DateTime::<Utc>::from_timestamp(i64::from(epoch) * 86_400, 0).unwrap();
        ExposureEvent {
            id: id.to_string(),
            epoch,
            duration_secs: 900,
            min_distance_m: 1.0,
            median_distance_m: 1.5,
            risk_score: 0.8,
            exposure_windows: 3,
            matched_intervals: 2,
            first_contact: at,
            last_contact: at,
        }
    }

    /// Behaviour every backend that actually stores must share
    pub fn exercise_backend(storage: &dyn StorageBackend) {
        storage.put_key(&stored_key(1)).unwrap();
        storage.put_key(&stored_key(2)).unwrap();
        storage.put_key(&stored_key(2)).unwrap();
        assert_eq!(storage.load_keys().unwrap().len(), 2);
        assert_eq!(storage.delete_keys_before(2).unwrap(), 1);
        assert_eq!(storage.load_keys().unwrap()[0].epoch, 2);

        let mut record = contact(7, 1_000);
        storage.upsert_contact(&record).unwrap();
        record.sample_count = 2;
        record.last_seen = DateTime::<Utc>::from_timestamp(1_100, 0).unwrap();
        storage.upsert_contact(&record).unwrap();
        storage.upsert_contact(&contact(8, 10)).unwrap();

        let contacts = storage.load_contacts().unwrap();
        assert_eq!(contacts.len(), 2);
        let merged = contacts.iter().find(|c| c.key == record.key).unwrap();
        assert_eq!(merged.sample_count, 2);

        let cutoff = DateTime::<Utc>::from_timestamp(500, 0).unwrap();
        assert_eq!(storage.delete_contacts_before(cutoff).unwrap(), 1);
        assert!(storage.delete_contact(&record.key).unwrap());
        assert!(storage.load_contacts().unwrap().is_empty());

        storage.upsert_exposure(&exposure("a", 3)).unwrap();
        storage.upsert_exposure(&exposure("a", 3)).unwrap();
        storage.upsert_exposure(&exposure("b", 9)).unwrap();
        assert_eq!(storage.load_exposures().unwrap().len(), 2);
        assert!(storage.delete_exposure("a").unwrap());
        assert!(!storage.delete_exposure("a").unwrap());
        assert_eq!(storage.delete_exposures_before(10).unwrap(), 1);

        let settings = EngineSettings {
            advertising_enabled: true,
            ..EngineSettings::default()
        };
        storage.save_settings(&settings).unwrap();
        assert_eq!(storage.load_settings().unwrap(), settings);

        storage.clear().unwrap();
        assert!(storage.load_keys().unwrap().is_empty());
        assert_eq!(storage.load_settings().unwrap(), EngineSettings::default());
        storage.health_check().unwrap();
    }
}
