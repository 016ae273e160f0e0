//! Exposure aggregation for one epoch

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::config::MatchingConfig;
use crate::contacts::{median, ContactKey, ContactRecord};

use super::ExposureEvent;

const EXPOSURE_ID_DOMAIN: &[u8] = b"proxi-exposure-v1";

/// Matched records for one epoch, deduplicated by key
#[derive(Default)]
pub(crate) struct EpochAccumulator<'a> {
    records: BTreeMap<ContactKey, &'a ContactRecord>,
    intervals: BTreeSet<u32>,
}

impl<'a> EpochAccumulator<'a> {
    pub(crate) fn add(&mut self, interval: u32, record: &'a ContactRecord) {
        self.intervals.insert(interval);
        self.records.insert(record.key, record);
    }

    /// Summarize into an event, or `None` if too few windows qualify
    pub(crate) fn finish(&self, epoch: u32, config: &MatchingConfig) -> Option<ExposureEvent> {
        let credit = config.sighting_credit();
        let duration = covered_duration(self.records.values().copied(), credit);

        let mut distances: Vec<f64> = self
            .records
            .values()
            .flat_map(|r| r.sightings.iter().map(|s| s.distance_m))
            .collect();
        let median_distance = median(&mut distances)?;
        let min_distance = self
            .records
            .values()
            .map(|r| r.min_distance_m)
            .fold(f64::INFINITY, f64::min);

        let window_secs = config.exposure_window_secs as i64;
        let windows: BTreeSet<i64> = self
            .records
            .values()
            .flat_map(|r| r.sightings.iter())
            .filter(|s| s.attenuation_db <= config.attenuation_threshold_db)
            .map(|s| s.at.timestamp().div_euclid(window_secs))
            .collect();
        if (windows.len() as u32) < config.min_exposure_windows {
            return None;
        }

        let first_contact = self.records.values().map(|r| r.first_seen).min()?;
        let last_contact = self.records.values().map(|r| r.last_seen).max()?;
        let duration_secs = duration.num_seconds().max(0) as u64;

        Some(ExposureEvent {
            id: self.exposure_id(epoch),
            epoch,
            duration_secs,
            min_distance_m: min_distance,
            median_distance_m: median_distance,
            risk_score: risk_score(duration_secs, median_distance, config),
            exposure_windows: windows.len() as u32,
            matched_intervals: self.intervals.len() as u32,
            first_contact,
            last_contact,
        })
    }

    fn exposure_id(&self, epoch: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(EXPOSURE_ID_DOMAIN);
        hasher.update(epoch.to_le_bytes());
        for key in self.records.keys() {
            hasher.update(key.identifier.as_bytes());
            hasher.update(key.bucket.to_le_bytes());
            hasher.update(key.opened_at_ms.to_le_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// Length of the union of `[first_seen, last_seen + credit]` over records
fn covered_duration<'a>(records: impl Iterator<Item = &'a ContactRecord>, credit: Duration) -> Duration {
    let mut spans: Vec<(DateTime<Utc>, DateTime<Utc>)> = records
        .map(|r| (r.first_seen, r.last_seen + credit))
        .collect();
    spans.sort();

    let mut total = Duration::zero();
    let mut current: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for (start, end) in spans {
        current = match current {
            Some((open, close)) if start <= close => Some((open, close.max(end))),
            Some((open, close)) => {
                total += close - open;
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((open, close)) = current {
        total += close - open;
    }
    total
}

/// Weighted blend of duration and proximity, in `[0, 1]`
pub fn risk_score(duration_secs: u64, median_distance_m: f64, config: &MatchingConfig) -> f64 {
    let duration_factor =
        (duration_secs as f64 / config.full_risk_duration_secs as f64).min(1.0);
    let proximity_factor = if median_distance_m <= config.full_risk_distance_m {
        1.0
    } else {
        config.full_risk_distance_m / median_distance_m
    };
    let total_weight = config.duration_weight + config.proximity_weight;
    (config.duration_weight * duration_factor + config.proximity_weight * proximity_factor)
        / total_weight
}
