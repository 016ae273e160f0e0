//! Exposure matching
//!
//! For every diagnosis key the matcher re-derives the identifiers the key
//! broadcast, probes a [`ContactSnapshot`] for each, and folds the hits into
//! one [`ExposureEvent`] per epoch. It only reads the snapshot; matched
//! records are neither mutated nor deleted.
//!
//! Malformed keys are reported in [`MatchReport::rejected`] and skipped.

mod diagnosis;
mod risk;

pub use diagnosis::{DiagnosisKey, PublishedKey};
pub use risk::risk_score;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use proxi_crypto::RpiDeriver;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{MatchingConfig, ProtocolConfig};
use crate::contacts::ContactSnapshot;

use risk::EpochAccumulator;

/// Result of matching diagnosis keys for one epoch
///
/// Immutable once created. `id` is derived from the epoch and the matched
/// records, so evaluating the same keys against the same history yields the
/// same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureEvent {
    pub id: String,
    pub epoch: u32,
    /// Cumulative time in proximity
    pub duration_secs: u64,
    pub min_distance_m: f64,
    pub median_distance_m: f64,
    /// Deterministic score in `[0, 1]`
    pub risk_score: f64,
    /// Exposure windows with at least one sample under the attenuation threshold
    pub exposure_windows: u32,
    pub matched_intervals: u32,
    pub first_contact: DateTime<Utc>,
    pub last_contact: DateTime<Utc>,
}

/// A key that failed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedKey {
    /// Position in the submitted batch
    pub index: usize,
    pub code: String,
    pub reason: String,
}

/// Outcome of one matching pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    /// Events ordered by epoch
    pub events: Vec<ExposureEvent>,
    pub rejected: Vec<RejectedKey>,
    pub keys_evaluated: usize,
}

/// Matches diagnosis keys against contact history
#[derive(Debug, Clone)]
pub struct ExposureMatcher {
    protocol: ProtocolConfig,
    config: MatchingConfig,
}

impl ExposureMatcher {
    pub fn new(protocol: ProtocolConfig, config: MatchingConfig) -> Self {
        Self { protocol, config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Replace thresholds and weights for subsequent passes
    pub fn set_config(&mut self, config: MatchingConfig) {
        self.config = config;
    }

    /// Validate and match a batch of published keys
    pub fn evaluate(&self, published: &[PublishedKey], contacts: &ContactSnapshot) -> MatchReport {
        let mut keys = Vec::with_capacity(published.len());
        let mut rejected = Vec::new();

        for (index, raw) in published.iter().enumerate() {
            match DiagnosisKey::parse(raw, &self.protocol) {
                Ok(key) => keys.push(key),
                Err(err) => {
                    warn!(index, error = %err, "Skipping malformed diagnosis key");
                    rejected.push(RejectedKey {
                        index,
                        code: err.error_code().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let events = self.evaluate_keys(&keys, contacts);
        MatchReport {
            events,
            rejected,
            keys_evaluated: keys.len(),
        }
    }

    /// Match already-validated keys, one event per epoch with enough exposure
    pub fn evaluate_keys(&self, keys: &[DiagnosisKey], contacts: &ContactSnapshot) -> Vec<ExposureEvent> {
        let tolerance = self.config.clock_tolerance();
        let mut epochs: BTreeMap<u32, EpochAccumulator<'_>> = BTreeMap::new();

        for key in keys {
            let epoch = key.epoch(&self.protocol);
            let deriver = RpiDeriver::new(&key.key);

            for interval in key.intervals() {
                let identifier = deriver.derive(interval);
                let earliest = self.protocol.interval_start(interval) - tolerance;
                let latest = self.protocol.interval_end(interval) + tolerance;

                for record in contacts.probe(&identifier) {
                    if record.last_seen < earliest || record.first_seen > latest {
                        debug!(%identifier, interval, "Ignoring sighting outside tolerance");
                        continue;
                    }
                    epochs.entry(epoch).or_default().add(interval, record);
                }
            }
        }

        let events: Vec<ExposureEvent> = epochs
            .iter()
            .filter_map(|(&epoch, acc)| acc.finish(epoch, &self.config))
            .collect();

        info!(
            keys = keys.len(),
            epochs_matched = epochs.len(),
            events = events.len(),
            "Exposure matching complete"
        );
        events
    }
}
