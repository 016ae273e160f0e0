//! File-based storage backend (JSON Lines)
//!
//! One append-only file per table. Upserts append a full row; loading keeps
//! the last row per key. Deletes rewrite the table through a temp file and a
//! rename, which also compacts superseded rows. Contact rows are compacted
//! on their own once enough appends pile up.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::hash::Hash;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{EngineSettings, StorageBackend};
use crate::contacts::{ContactKey, ContactRecord};
use crate::error::{ProxiError, Result};
use crate::keys::StoredKey;
use crate::matcher::ExposureEvent;

const KEYS_TABLE: &str = "keys.jsonl";
const CONTACTS_TABLE: &str = "contacts.jsonl";
const EXPOSURES_TABLE: &str = "exposures.jsonl";
const SETTINGS_FILE: &str = "settings.json";

/// Appends to the contacts table before it is compacted
const CONTACT_COMPACTION_THRESHOLD: usize = 1024;

/// File-based storage backend
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    io_lock: Mutex<()>,
    contact_appends: AtomicUsize,
}

impl FileStorage {
    /// Open (or create) storage in the given directory
    pub fn new<P: Into<PathBuf>>(directory: P) -> Result<Self> {
        let dir = directory.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ProxiError::io("Failed to create storage directory", e))?;
        Ok(Self {
            directory: dir,
            io_lock: Mutex::new(()),
            contact_appends: AtomicUsize::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, table: &str) -> PathBuf {
        self.directory.join(table)
    }

    fn append<T: Serialize>(&self, table: &str, row: &T) -> Result<()> {
        let line = serde_json::to_string(row)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(table))
            .map_err(|e| ProxiError::io("Failed to open table", e))?;
        writeln!(file, "{}", line).map_err(|e| ProxiError::io("Failed to append row", e))
    }

    fn read_rows<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        let path = self.path(table);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|e| ProxiError::io("Failed to open table", e))?;

        let mut rows = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| ProxiError::io("Failed to read row", e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(row) => rows.push(row),
                // a crash mid-append leaves at most one torn trailing row
                Err(e) => warn!(table, line = number + 1, error = %e, "Skipping unreadable row"),
            }
        }
        Ok(rows)
    }

    /// Replace a table's contents atomically
    fn rewrite<T: Serialize>(&self, table: &str, rows: &[T]) -> Result<()> {
        let tmp = self.path(&format!("{}.tmp", table));
        {
            let file = File::create(&tmp).map_err(|e| ProxiError::io("Failed to create temp table", e))?;
            let mut writer = BufWriter::new(file);
            for row in rows {
                serde_json::to_writer(&mut writer, row)?;
                writer
                    .write_all(b"\n")
                    .map_err(|e| ProxiError::io("Failed to write row", e))?;
            }
            writer
                .flush()
                .map_err(|e| ProxiError::io("Failed to flush table", e))?;
        }
        fs::rename(&tmp, self.path(table)).map_err(|e| ProxiError::io("Failed to replace table", e))
    }

    fn latest_keys(&self) -> Result<BTreeMap<u32, StoredKey>> {
        Ok(self
            .read_rows::<StoredKey>(KEYS_TABLE)?
            .into_iter()
            .map(|k| (k.epoch, k))
            .collect())
    }

    fn latest_contacts(&self) -> Result<Vec<ContactRecord>> {
        Ok(last_wins(self.read_rows(CONTACTS_TABLE)?, |r: &ContactRecord| r.key))
    }

    fn latest_exposures(&self) -> Result<Vec<ExposureEvent>> {
        Ok(last_wins(self.read_rows(EXPOSURES_TABLE)?, |e: &ExposureEvent| e.id.clone()))
    }

    fn compact_contacts(&self) -> Result<()> {
        let contacts = self.latest_contacts()?;
        self.rewrite(CONTACTS_TABLE, &contacts)?;
        self.contact_appends.store(0, Ordering::Relaxed);
        debug!(rows = contacts.len(), "Compacted contacts table");
        Ok(())
    }
}

/// Keep the last row per key, in order of first appearance
fn last_wins<T, K, F>(rows: Vec<T>, key_of: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut position: HashMap<K, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::new();
    for row in rows {
        match position.get(&key_of(&row)) {
            Some(&i) => out[i] = row,
            None => {
                position.insert(key_of(&row), out.len());
                out.push(row);
            }
        }
    }
    out
}

impl StorageBackend for FileStorage {
    fn put_key(&self, key: &StoredKey) -> Result<()> {
        let _guard = self.io_lock.lock();
        self.append(KEYS_TABLE, key)
    }

    fn load_keys(&self) -> Result<Vec<StoredKey>> {
        let _guard = self.io_lock.lock();
        Ok(self.latest_keys()?.into_values().collect())
    }

    fn delete_keys_before(&self, epoch: u32) -> Result<usize> {
        let _guard = self.io_lock.lock();
        let mut keys = self.latest_keys()?;
        let retained = keys.split_off(&epoch);
        let removed = keys.len();
        let rows: Vec<StoredKey> = retained.into_values().collect();
        self.rewrite(KEYS_TABLE, &rows)?;
        Ok(removed)
    }

    fn upsert_contact(&self, record: &ContactRecord) -> Result<()> {
        let _guard = self.io_lock.lock();
        self.append(CONTACTS_TABLE, record)?;
        if self.contact_appends.fetch_add(1, Ordering::Relaxed) + 1 >= CONTACT_COMPACTION_THRESHOLD {
            self.compact_contacts()?;
        }
        Ok(())
    }

    fn delete_contact(&self, key: &ContactKey) -> Result<bool> {
        let _guard = self.io_lock.lock();
        let mut contacts = self.latest_contacts()?;
        let before = contacts.len();
        contacts.retain(|r| &r.key != key);
        let removed = before != contacts.len();
        self.rewrite(CONTACTS_TABLE, &contacts)?;
        Ok(removed)
    }

    fn load_contacts(&self) -> Result<Vec<ContactRecord>> {
        let _guard = self.io_lock.lock();
        self.latest_contacts()
    }

    fn delete_contacts_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.io_lock.lock();
        let mut contacts = self.latest_contacts()?;
        let before = contacts.len();
        contacts.retain(|r| r.last_seen >= cutoff);
        self.rewrite(CONTACTS_TABLE, &contacts)?;
        self.contact_appends.store(0, Ordering::Relaxed);
        Ok(before - contacts.len())
    }

    fn upsert_exposure(&self, event: &ExposureEvent) -> Result<()> {
        let _guard = self.io_lock.lock();
        self.append(EXPOSURES_TABLE, event)
    }

    fn delete_exposure(&self, id: &str) -> Result<bool> {
        let _guard = self.io_lock.lock();
        let mut events = self.latest_exposures()?;
        let before = events.len();
        events.retain(|e| e.id != id);
        self.rewrite(EXPOSURES_TABLE, &events)?;
        Ok(before != events.len())
    }

    fn load_exposures(&self) -> Result<Vec<ExposureEvent>> {
        let _guard = self.io_lock.lock();
        self.latest_exposures()
    }

    fn delete_exposures_before(&self, epoch: u32) -> Result<usize> {
        let _guard = self.io_lock.lock();
        let mut events = self.latest_exposures()?;
        let before = events.len();
        events.retain(|e| e.epoch >= epoch);
        self.rewrite(EXPOSURES_TABLE, &events)?;
        Ok(before - events.len())
    }

    fn load_settings(&self) -> Result<EngineSettings> {
        let _guard = self.io_lock.lock();
        let path = self.path(SETTINGS_FILE);
        if !path.exists() {
            return Ok(EngineSettings::default());
        }
        let raw = fs::read_to_string(&path).map_err(|e| ProxiError::io("Failed to read settings", e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save_settings(&self, settings: &EngineSettings) -> Result<()> {
        let _guard = self.io_lock.lock();
        let tmp = self.path("settings.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(settings)?)
            .map_err(|e| ProxiError::io("Failed to write settings", e))?;
        fs::rename(&tmp, self.path(SETTINGS_FILE)).map_err(|e| ProxiError::io("Failed to replace settings", e))
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.io_lock.lock();
        for table in [KEYS_TABLE, CONTACTS_TABLE, EXPOSURES_TABLE, SETTINGS_FILE] {
            let path = self.path(table);
            if path.exists() {
                fs::remove_file(&path).map_err(|e| ProxiError::io("Failed to delete table", e))?;
            }
        }
        self.contact_appends.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        if self.directory.is_dir() {
            Ok(())
        } else {
            Err(ProxiError::Io {
                message: "Storage directory does not exist".to_string(),
            })
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    #[test]
    fn test_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        exercise_backend(&FileStorage::new(dir.path()).unwrap());
    }

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            storage.put_key(&stored_key(4)).unwrap();
            storage.upsert_exposure(&exposure("x", 4)).unwrap();
        }
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_keys().unwrap()[0].epoch, 4);
        assert_eq!(storage.load_exposures().unwrap()[0].id, "x");
    }

    #[test]
    fn test_torn_trailing_row_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        storage.put_key(&stored_key(1)).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(KEYS_TABLE))
            .unwrap();
        write!(file, "{{\"epoch\":2,\"ke").unwrap();

        assert_eq!(storage.load_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_contacts_are_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let mut record = contact(1, 1_000);
        for count in 1..=(CONTACT_COMPACTION_THRESHOLD as u32 + 10) {
            record.sample_count = count;
            storage.upsert_contact(&record).unwrap();
        }

        let raw = fs::read_to_string(dir.path().join(CONTACTS_TABLE)).unwrap();
        assert!(raw.lines().count() <= 11);
        assert_eq!(
            storage.load_contacts().unwrap()[0].sample_count,
            CONTACT_COMPACTION_THRESHOLD as u32 + 10
        );
    }
}
