//! Contact history
//!
//! [`ContactStore`] keeps one [`ContactRecord`] per encounter with a peer
//! identifier. Repeated sightings of the same identifier within the
//! coalescing window extend an existing record instead of creating a new one,
//! so at-least-once delivery from the radio is harmless.
//!
//! ## Concurrency
//!
//! The table lives behind `RwLock<Arc<ContactTable>>`. Writers hold the lock
//! for the whole merge and publish through `Arc::make_mut`, so readers either
//! see a record before or after a merge, never halfway. A
//! [`ContactSnapshot`] is just a clone of the `Arc`; matching passes run on
//! it without blocking the scanner.
//!
//! ## Persistence
//!
//! Sightings only touch memory. Changed records are queued and written by
//! [`ContactStore::flush`], one row per record no matter how many sightings
//! it absorbed since the last flush.

mod signal;

pub use signal::{median, SignalSample, Sighting};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::{Bound, RangeInclusive};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use proxi_crypto::RollingProximityIdentifier;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ProtocolConfig, SignalModel};
use crate::error::Result;
use crate::storage::StorageBackend;

/// Primary key of a contact record, ordered by time bucket first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactKey {
    /// Interval of the sighting that opened the record
    pub bucket: u32,
    pub identifier: RollingProximityIdentifier,
    /// Timestamp (ms) of the sighting that opened the record
    pub opened_at_ms: i64,
}

impl ContactKey {
    /// Stable string form used by storage backends
    pub fn storage_id(&self) -> String {
        format!("{}:{}:{}", self.identifier, self.bucket, self.opened_at_ms)
    }

    fn lower_bound(bucket: u32) -> Self {
        Self {
            bucket,
            identifier: RollingProximityIdentifier::from_bytes([0; 16]),
            opened_at_ms: i64::MIN,
        }
    }
}

/// One encounter with a peer identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub key: ContactKey,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Every sample ever absorbed, including trimmed ones
    pub sample_count: u32,
    /// Running mean of the distance estimates
    pub mean_distance_m: f64,
    pub min_distance_m: f64,
    /// Most recent samples, oldest first
    pub sightings: Vec<Sighting>,
}

impl ContactRecord {
    fn open(identifier: RollingProximityIdentifier, bucket: u32, sighting: Sighting) -> Self {
        Self {
            key: ContactKey {
                bucket,
                identifier,
                opened_at_ms: sighting.at.timestamp_millis(),
            },
            first_seen: sighting.at,
            last_seen: sighting.at,
            sample_count: 1,
            mean_distance_m: sighting.distance_m,
            min_distance_m: sighting.distance_m,
            sightings: vec![sighting],
        }
    }

    pub fn identifier(&self) -> &RollingProximityIdentifier {
        &self.key.identifier
    }

    /// Time between the first and last sighting
    pub fn span(&self) -> Duration {
        self.last_seen - self.first_seen
    }

    fn accepts(&self, at: DateTime<Utc>, window: Duration) -> bool {
        at >= self.first_seen - window && at <= self.last_seen + window
    }

    fn absorb(&mut self, sighting: Sighting, max_samples: usize) {
        self.first_seen = self.first_seen.min(sighting.at);
        self.last_seen = self.last_seen.max(sighting.at);
        self.sample_count += 1;
        self.mean_distance_m +=
            (sighting.distance_m - self.mean_distance_m) / f64::from(self.sample_count);
        self.min_distance_m = self.min_distance_m.min(sighting.distance_m);

        let pos = self.sightings.partition_point(|s| s.at <= sighting.at);
        self.sightings.insert(pos, sighting);
        self.trim(max_samples);
    }

    fn merge(&mut self, other: &ContactRecord, max_samples: usize) {
        let total = self.sample_count + other.sample_count;
        self.mean_distance_m = (self.mean_distance_m * f64::from(self.sample_count)
            + other.mean_distance_m * f64::from(other.sample_count))
            / f64::from(total);
        self.sample_count = total;
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.min_distance_m = self.min_distance_m.min(other.min_distance_m);

        self.sightings.extend_from_slice(&other.sightings);
        self.sightings.sort_by_key(|s| s.at);
        self.trim(max_samples);
    }

    fn trim(&mut self, max_samples: usize) {
        if self.sightings.len() > max_samples {
            let excess = self.sightings.len() - max_samples;
            self.sightings.drain(..excess);
        }
    }
}

/// What `record` did with a sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new record was opened
    Created(ContactKey),
    /// The sighting extended an existing record
    Merged(ContactKey),
    /// The sighting is already outside the retention window
    Expired,
}

#[derive(Debug, Clone, Default)]
struct ContactTable {
    records: BTreeMap<ContactKey, Arc<ContactRecord>>,
    by_identifier: HashMap<RollingProximityIdentifier, Vec<ContactKey>>,
}

impl ContactTable {
    fn insert(&mut self, record: ContactRecord) {
        let key = record.key;
        let keys = self.by_identifier.entry(key.identifier).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
        self.records.insert(key, Arc::new(record));
    }

    fn remove(&mut self, key: &ContactKey) {
        self.records.remove(key);
        if let Some(keys) = self.by_identifier.get_mut(&key.identifier) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.by_identifier.remove(&key.identifier);
            }
        }
    }

    fn for_identifier(
        &self,
        identifier: &RollingProximityIdentifier,
    ) -> impl Iterator<Item = &Arc<ContactRecord>> + '_ {
        self.by_identifier
            .get(identifier)
            .into_iter()
            .flatten()
            .filter_map(move |key| self.records.get(key))
    }
}

/// Records changed in memory but not yet written
#[derive(Debug, Default)]
struct PendingWrites {
    upserts: BTreeSet<ContactKey>,
    deletes: BTreeSet<ContactKey>,
}

impl PendingWrites {
    fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    fn absorb(&mut self, other: PendingWrites) {
        self.upserts.extend(other.upserts);
        self.deletes.extend(other.deletes);
    }
}

/// Persistent, coalescing store of observed identifiers
pub struct ContactStore {
    protocol: ProtocolConfig,
    signal: SignalModel,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    table: RwLock<Arc<ContactTable>>,
    pending: Mutex<PendingWrites>,
    flush_lock: Mutex<()>,
}

impl ContactStore {
    /// Create a store, reloading unexpired records from storage
    pub fn new(
        protocol: ProtocolConfig,
        signal: SignalModel,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cutoff = clock.now() - protocol.retention();
        let mut table = ContactTable::default();
        for record in storage.load_contacts()? {
            if record.last_seen >= cutoff {
                table.insert(record);
            }
        }
        storage.delete_contacts_before(cutoff)?;
        debug!(
            count = table.records.len(),
            backend = storage.name(),
            "Loaded contact records"
        );

        Ok(Self {
            protocol,
            signal,
            storage,
            clock,
            table: RwLock::new(Arc::new(table)),
            pending: Mutex::new(PendingWrites::default()),
            flush_lock: Mutex::new(()),
        })
    }

    /// Record one sighting of `identifier`
    ///
    /// Merges into every existing record of the identifier whose span is
    /// within the coalescing window of `at`; otherwise opens a new record.
    /// The change is visible to readers at once and reaches storage on the
    /// next [`ContactStore::flush`].
    pub fn record(
        &self,
        identifier: RollingProximityIdentifier,
        at: DateTime<Utc>,
        sample: SignalSample,
    ) -> Result<RecordOutcome> {
        if at < self.clock.now() - self.protocol.retention() {
            debug!(%identifier, "Dropping sighting older than retention");
            return Ok(RecordOutcome::Expired);
        }

        let sighting = Sighting::from_sample(at, &sample, &self.signal);
        let window = self.protocol.coalescing_window();
        let max_samples = self.signal.max_samples_per_record;

        let mut guard = self.table.write();
        let hits: Vec<Arc<ContactRecord>> = guard
            .for_identifier(&identifier)
            .filter(|r| r.accepts(at, window))
            .cloned()
            .collect();

        let (record, absorbed, outcome) = match hits.split_first() {
            None => {
                let bucket = self.protocol.interval_at(at);
                let record = ContactRecord::open(identifier, bucket, sighting);
                let key = record.key;
                (record, Vec::new(), RecordOutcome::Created(key))
            }
            Some((first, rest)) => {
                let mut record = ContactRecord::clone(first);
                record.absorb(sighting, max_samples);
                for other in rest {
                    record.merge(other, max_samples);
                }
                let absorbed: Vec<ContactKey> = rest.iter().map(|r| r.key).collect();
                let key = record.key;
                (record, absorbed, RecordOutcome::Merged(key))
            }
        };

        {
            let mut pending = self.pending.lock();
            pending.upserts.insert(record.key);
            for key in &absorbed {
                pending.upserts.remove(key);
                pending.deletes.insert(*key);
            }
        }

        debug!(
            %identifier,
            samples = record.sample_count,
            merged = matches!(outcome, RecordOutcome::Merged(_)),
            "Recorded sighting"
        );

        let table = Arc::make_mut(&mut *guard);
        for key in &absorbed {
            table.remove(key);
        }
        table.insert(record);

        Ok(outcome)
    }

    /// Write every record changed since the last flush
    ///
    /// Returns the number of rows written or deleted. On failure nothing is
    /// lost: the unwritten changes stay queued for the next call.
    pub fn flush(&self) -> Result<usize> {
        let _flushing = self.flush_lock.lock();
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        let table = Arc::clone(&self.table.read());
        match self.write_batch(&table, &batch) {
            Ok(written) => {
                debug!(written, backend = self.storage.name(), "Flushed contact records");
                Ok(written)
            }
            Err(e) => {
                warn!(error = %e, "Contact flush failed, keeping changes queued");
                self.pending.lock().absorb(batch);
                Err(e)
            }
        }
    }

    fn write_batch(&self, table: &ContactTable, batch: &PendingWrites) -> Result<usize> {
        let mut written = 0;
        // records pruned or reset since they were queued are skipped
        for record in batch.upserts.iter().filter_map(|key| table.records.get(key)) {
            self.storage.upsert_contact(record)?;
            written += 1;
        }
        for key in batch.deletes.iter().filter(|key| !table.records.contains_key(key)) {
            self.storage.delete_contact(key)?;
            written += 1;
        }
        Ok(written)
    }

    /// Number of records waiting for [`ContactStore::flush`]
    pub fn pending_writes(&self) -> usize {
        let pending = self.pending.lock();
        pending.upserts.len() + pending.deletes.len()
    }

    /// Consistent point-in-time view for matching
    pub fn snapshot(&self) -> ContactSnapshot {
        ContactSnapshot {
            table: Arc::clone(&self.table.read()),
            cutoff: self.clock.now() - self.protocol.retention(),
            protocol: self.protocol.clone(),
        }
    }

    /// Records opened during `epochs`, lazily, from a fresh snapshot
    pub fn query_active(&self, epochs: RangeInclusive<u32>) -> ContactQuery {
        self.snapshot().query(epochs)
    }

    /// Delete records last seen before `now - retention`
    ///
    /// Idempotent: a second call with the same clock removes nothing.
    pub fn prune(&self, retention: Duration) -> Result<usize> {
        let cutoff = self.clock.now() - retention;
        let mut guard = self.table.write();
        let expired: Vec<ContactKey> = guard
            .records
            .values()
            .filter(|r| r.last_seen < cutoff)
            .map(|r| r.key)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        self.storage.delete_contacts_before(cutoff)?;
        let table = Arc::make_mut(&mut *guard);
        for key in &expired {
            table.remove(key);
        }
        info!(removed = expired.len(), %cutoff, "Pruned contact records");
        Ok(expired.len())
    }

    /// Prune with the configured retention window
    pub fn prune_expired(&self) -> Result<usize> {
        self.prune(self.protocol.retention())
    }

    /// Drop every record held in memory; storage is cleared by the caller
    pub fn reset(&self) {
        let mut guard = self.table.write();
        *self.pending.lock() = PendingWrites::default();
        *guard = Arc::new(ContactTable::default());
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable view of the contact table at one instant
#[derive(Clone)]
pub struct ContactSnapshot {
    table: Arc<ContactTable>,
    cutoff: DateTime<Utc>,
    protocol: ProtocolConfig,
}

impl ContactSnapshot {
    /// Unexpired records for `identifier`
    pub fn probe(
        &self,
        identifier: &RollingProximityIdentifier,
    ) -> impl Iterator<Item = &ContactRecord> + '_ {
        let cutoff = self.cutoff;
        self.table
            .for_identifier(identifier)
            .map(|r| &**r)
            .filter(move |r| r.last_seen >= cutoff)
    }

    pub fn len(&self) -> usize {
        self.table
            .records
            .values()
            .filter(|r| r.last_seen >= self.cutoff)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily iterate records opened during `epochs`
    pub fn query(&self, epochs: RangeInclusive<u32>) -> ContactQuery {
        let (first, last) = epochs.into_inner();
        let start = Bound::Included(ContactKey::lower_bound(
            self.protocol.epoch_start_interval(first),
        ));
        let end = match last.checked_add(1) {
            Some(next) if self.protocol.epoch_start_interval(next) > self.protocol.epoch_start_interval(last) => {
                Bound::Excluded(ContactKey::lower_bound(self.protocol.epoch_start_interval(next)))
            }
            _ => Bound::Unbounded,
        };
        ContactQuery {
            table: Arc::clone(&self.table),
            cursor: start,
            end,
            cutoff: self.cutoff,
            done: first > last,
        }
    }
}

/// Lazy, finite iterator over a snapshot's records in bucket order
///
/// Clone it to iterate the same snapshot again; ask the store for a new
/// query to see later writes.
#[derive(Clone)]
pub struct ContactQuery {
    table: Arc<ContactTable>,
    cursor: Bound<ContactKey>,
    end: Bound<ContactKey>,
    cutoff: DateTime<Utc>,
    done: bool,
}

impl Iterator for ContactQuery {
    type Item = Arc<ContactRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let Some((key, record)) = self.table.records.range((self.cursor, self.end)).next() else {
                self.done = true;
                break;
            };
            self.cursor = Bound::Excluded(*key);
            if record.last_seen >= self.cutoff {
                return Some(Arc::clone(record));
            }
        }
        None
    }
}
