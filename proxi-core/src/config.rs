//! Configuration for the tracing engine
//!
//! Every timing value here is policy rather than protocol: interval length,
//! epoch size, retention and coalescing can all be tuned per deployment.
//! Files are JSON; missing fields fall back to the defaults below.

use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProxiError, Result};

/// Longest retention period accepted
pub const MAX_RETENTION_DAYS: u32 = 366;

/// Upper bound for intervals, windows and tolerances given in seconds
pub const MAX_WINDOW_SECS: u64 = 86_400;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub signal: SignalModel,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub radio: RadioConfig,

    /// Period of the retention sweep in seconds
    #[serde(default = "default_sweep_secs")]
    pub retention_sweep_secs: u64,
}

fn default_sweep_secs() -> u64 { 3600 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            signal: SignalModel::default(),
            matching: MatchingConfig::default(),
            radio: RadioConfig::default(),
            retention_sweep_secs: default_sweep_secs(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProxiError::io(&format!("Failed to read {}", path.display()), e))?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_signal(mut self, signal: SignalModel) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_matching(mut self, matching: MatchingConfig) -> Self {
        self.matching = matching;
        self
    }

    pub fn with_radio(mut self, radio: RadioConfig) -> Self {
        self.radio = radio;
        self
    }

    pub fn with_retention_sweep(mut self, period: StdDuration) -> Self {
        self.retention_sweep_secs = period.as_secs().max(1);
        self
    }

    pub fn retention_sweep(&self) -> StdDuration {
        StdDuration::from_secs(self.retention_sweep_secs)
    }

    /// Check every section, reporting the first bad field
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        self.signal.validate()?;
        self.matching.validate()?;
        self.radio.validate()?;
        if self.retention_sweep_secs == 0 {
            return Err(invalid("retention_sweep_secs", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ProxiError {
    ProxiError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Protocol timing
// ═══════════════════════════════════════════════════════════════════════════

/// Interval, epoch, retention and coalescing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Length of one identifier interval in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Intervals covered by one tracing key
    #[serde(default = "default_intervals_per_epoch")]
    pub intervals_per_epoch: u32,

    /// Days contacts, keys and exposures are kept
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Sightings of one identifier closer than this are merged
    #[serde(default = "default_coalescing_secs")]
    pub coalescing_window_secs: u64,
}

fn default_interval_secs() -> u64 { 600 }
fn default_intervals_per_epoch() -> u32 { 144 }
fn default_retention_days() -> u32 { 14 }
fn default_coalescing_secs() -> u64 { 300 }

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            intervals_per_epoch: default_intervals_per_epoch(),
            retention_days: default_retention_days(),
            coalescing_window_secs: default_coalescing_secs(),
        }
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval_length(mut self, length: StdDuration) -> Self {
        self.interval_secs = length.as_secs();
        self
    }

    pub fn with_intervals_per_epoch(mut self, count: u32) -> Self {
        self.intervals_per_epoch = count;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_coalescing_window(mut self, window: StdDuration) -> Self {
        self.coalescing_window_secs = window.as_secs();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(invalid("protocol.interval_secs", "must be positive"));
        }
        if self.intervals_per_epoch == 0 {
            return Err(invalid("protocol.intervals_per_epoch", "must be positive"));
        }
        if self.retention_days == 0 {
            return Err(invalid("protocol.retention_days", "must be at least one day"));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(invalid("protocol.retention_days", "must not exceed 366 days"));
        }
        if self.interval_secs > MAX_WINDOW_SECS {
            return Err(invalid("protocol.interval_secs", "must not exceed one day"));
        }
        if self.coalescing_window_secs > MAX_WINDOW_SECS {
            return Err(invalid("protocol.coalescing_window_secs", "must not exceed one day"));
        }
        Ok(())
    }

    pub fn interval_length(&self) -> StdDuration {
        StdDuration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }

    pub fn coalescing_window(&self) -> Duration {
        Duration::seconds(self.coalescing_window_secs as i64)
    }

    /// Interval number containing `at`; instants before 1970 map to 0
    pub fn interval_at(&self, at: DateTime<Utc>) -> u32 {
        let secs = at.timestamp().max(0) as u64;
        (secs / self.interval_secs).min(u64::from(u32::MAX)) as u32
    }

    pub fn interval_start(&self, interval: u32) -> DateTime<Utc> {
        let secs = u64::from(interval) * self.interval_secs;
        DateTime::<Utc>::from_timestamp(secs as i64, 0).unwrap_or_default()
    }

    pub fn interval_end(&self, interval: u32) -> DateTime<Utc> {
        self.interval_start(interval) + Duration::seconds(self.interval_secs as i64)
    }

    pub fn epoch_of(&self, interval: u32) -> u32 {
        interval / self.intervals_per_epoch
    }

    pub fn epoch_at(&self, at: DateTime<Utc>) -> u32 {
        self.epoch_of(self.interval_at(at))
    }

    /// First interval of `epoch` (the key's rolling start interval)
    pub fn epoch_start_interval(&self, epoch: u32) -> u32 {
        epoch.saturating_mul(self.intervals_per_epoch)
    }

    pub fn epoch_start(&self, epoch: u32) -> DateTime<Utc> {
        self.interval_start(self.epoch_start_interval(epoch))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Signal model
// ═══════════════════════════════════════════════════════════════════════════

/// Log-distance path-loss model used to turn RSSI into meters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalModel {
    /// Received power at one meter when the peer does not advertise it
    #[serde(default = "default_reference_power")]
    pub reference_tx_power_dbm: f64,

    /// Path-loss exponent (2.0 in free space, higher indoors)
    #[serde(default = "default_path_loss")]
    pub path_loss_exponent: f64,

    /// Raw samples retained per contact record
    #[serde(default = "default_max_samples")]
    pub max_samples_per_record: usize,
}

fn default_reference_power() -> f64 { -59.0 }
fn default_path_loss() -> f64 { 2.0 }
fn default_max_samples() -> usize { 512 }

impl Default for SignalModel {
    fn default() -> Self {
        Self {
            reference_tx_power_dbm: default_reference_power(),
            path_loss_exponent: default_path_loss(),
            max_samples_per_record: default_max_samples(),
        }
    }
}

impl SignalModel {
    pub fn with_reference_tx_power(mut self, dbm: f64) -> Self {
        self.reference_tx_power_dbm = dbm;
        self
    }

    pub fn with_path_loss_exponent(mut self, exponent: f64) -> Self {
        self.path_loss_exponent = exponent;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.path_loss_exponent > 0.0) {
            return Err(invalid("signal.path_loss_exponent", "must be positive"));
        }
        if self.max_samples_per_record == 0 {
            return Err(invalid("signal.max_samples_per_record", "must be positive"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Matching and risk
// ═══════════════════════════════════════════════════════════════════════════

/// Exposure matching thresholds and risk weights
///
/// Risk score = (w_d * duration_factor + w_p * proximity_factor) / (w_d + w_p)
/// where `duration_factor = min(duration / full_risk_duration, 1)` and
/// `proximity_factor = min(full_risk_distance / median_distance, 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Allowed skew between an identifier's interval and its sighting
    #[serde(default = "default_tolerance_secs")]
    pub clock_tolerance_secs: u64,

    /// Samples above this attenuation do not count toward exposure windows
    #[serde(default = "default_attenuation_threshold")]
    pub attenuation_threshold_db: f64,

    /// Length of one exposure window
    #[serde(default = "default_window_secs")]
    pub exposure_window_secs: u64,

    /// Qualifying windows required before an epoch is reported
    #[serde(default = "default_min_windows")]
    pub min_exposure_windows: u32,

    /// Presence credited to each sighting (normally the scan interval)
    #[serde(default = "default_sighting_credit")]
    pub sighting_credit_secs: u64,

    #[serde(default = "default_duration_weight")]
    pub duration_weight: f64,

    #[serde(default = "default_proximity_weight")]
    pub proximity_weight: f64,

    /// Median distance at or below which proximity risk is maximal
    #[serde(default = "default_full_risk_distance")]
    pub full_risk_distance_m: f64,

    /// Cumulative duration at or above which duration risk is maximal
    #[serde(default = "default_full_risk_duration")]
    pub full_risk_duration_secs: u64,
}

fn default_tolerance_secs() -> u64 { 7200 }
fn default_attenuation_threshold() -> f64 { 20.0 }
fn default_window_secs() -> u64 { 300 }
fn default_min_windows() -> u32 { 3 }
fn default_sighting_credit() -> u64 { 60 }
fn default_duration_weight() -> f64 { 0.6 }
fn default_proximity_weight() -> f64 { 0.4 }
fn default_full_risk_distance() -> f64 { 2.0 }
fn default_full_risk_duration() -> u64 { 900 }

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            clock_tolerance_secs: default_tolerance_secs(),
            attenuation_threshold_db: default_attenuation_threshold(),
            exposure_window_secs: default_window_secs(),
            min_exposure_windows: default_min_windows(),
            sighting_credit_secs: default_sighting_credit(),
            duration_weight: default_duration_weight(),
            proximity_weight: default_proximity_weight(),
            full_risk_distance_m: default_full_risk_distance(),
            full_risk_duration_secs: default_full_risk_duration(),
        }
    }
}

impl MatchingConfig {
    /// Set the two matching parameters a host usually exposes
    pub fn with_matching_parameters(mut self, attenuation_threshold_db: f64, min_windows: u32) -> Self {
        self.attenuation_threshold_db = attenuation_threshold_db;
        self.min_exposure_windows = min_windows;
        self
    }

    pub fn with_clock_tolerance(mut self, tolerance: StdDuration) -> Self {
        self.clock_tolerance_secs = tolerance.as_secs();
        self
    }

    pub fn with_sighting_credit(mut self, credit: StdDuration) -> Self {
        self.sighting_credit_secs = credit.as_secs();
        self
    }

    pub fn with_weights(mut self, duration_weight: f64, proximity_weight: f64) -> Self {
        self.duration_weight = duration_weight;
        self.proximity_weight = proximity_weight;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.exposure_window_secs == 0 {
            return Err(invalid("matching.exposure_window_secs", "must be positive"));
        }
        for (field, secs) in [
            ("matching.clock_tolerance_secs", self.clock_tolerance_secs),
            ("matching.exposure_window_secs", self.exposure_window_secs),
            ("matching.sighting_credit_secs", self.sighting_credit_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                return Err(invalid(field, "must not exceed one day"));
            }
        }
        if self.duration_weight < 0.0 || self.proximity_weight < 0.0 {
            return Err(invalid("matching.weights", "must not be negative"));
        }
        if !(self.duration_weight + self.proximity_weight > 0.0) {
            return Err(invalid("matching.weights", "at least one weight must be positive"));
        }
        if !(self.full_risk_distance_m > 0.0) {
            return Err(invalid("matching.full_risk_distance_m", "must be positive"));
        }
        if self.full_risk_duration_secs == 0 {
            return Err(invalid("matching.full_risk_duration_secs", "must be positive"));
        }
        Ok(())
    }

    pub fn clock_tolerance(&self) -> Duration {
        Duration::seconds(self.clock_tolerance_secs as i64)
    }

    pub fn sighting_credit(&self) -> Duration {
        Duration::seconds(self.sighting_credit_secs as i64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Radio session
// ═══════════════════════════════════════════════════════════════════════════

/// Scan duty cycle, retry policy and shutdown deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Period of one scan cycle
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Time spent scanning within each cycle
    #[serde(default = "default_scan_duration")]
    pub scan_duration_secs: u64,

    /// First retry delay after a transient fault
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,

    /// Upper bound for a single retry delay
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Attempts before a transient fault becomes terminal
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,

    /// Bound on how long stop() waits for radio duties to wind down
    #[serde(default = "default_stop_deadline")]
    pub stop_deadline_ms: u64,
}

fn default_scan_interval() -> u64 { 60 }
fn default_scan_duration() -> u64 { 20 }
fn default_retry_base() -> u64 { 500 }
fn default_retry_max() -> u64 { 30_000 }
fn default_retry_multiplier() -> f64 { 2.0 }
fn default_retry_attempts() -> u32 { 5 }
fn default_stop_deadline() -> u64 { 2000 }

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            scan_duration_secs: default_scan_duration(),
            retry_base_ms: default_retry_base(),
            retry_max_ms: default_retry_max(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_attempts: default_retry_attempts(),
            stop_deadline_ms: default_stop_deadline(),
        }
    }
}

impl RadioConfig {
    pub fn with_scan_cycle(mut self, interval: StdDuration, duration: StdDuration) -> Self {
        self.scan_interval_secs = interval.as_secs();
        self.scan_duration_secs = duration.as_secs();
        self
    }

    pub fn with_retry(mut self, base: StdDuration, max: StdDuration, attempts: u32) -> Self {
        self.retry_base_ms = base.as_millis() as u64;
        self.retry_max_ms = max.as_millis() as u64;
        self.retry_max_attempts = attempts;
        self
    }

    pub fn with_stop_deadline(mut self, deadline: StdDuration) -> Self {
        self.stop_deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_interval_secs == 0 || self.scan_duration_secs == 0 {
            return Err(invalid("radio.scan", "interval and duration must be positive"));
        }
        if self.retry_max_attempts == 0 {
            return Err(invalid("radio.retry_max_attempts", "must be at least 1"));
        }
        if self.retry_multiplier < 1.0 {
            return Err(invalid("radio.retry_multiplier", "must be at least 1.0"));
        }
        Ok(())
    }

    /// True when the scanner never pauses between cycles
    pub fn scans_continuously(&self) -> bool {
        self.scan_duration_secs >= self.scan_interval_secs
    }

    pub fn scan_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.scan_interval_secs)
    }

    pub fn scan_duration(&self) -> StdDuration {
        StdDuration::from_secs(self.scan_duration_secs.min(self.scan_interval_secs))
    }

    pub fn stop_deadline(&self) -> StdDuration {
        StdDuration::from_millis(self.stop_deadline_ms)
    }

    /// Delay before retry number `attempt` (0-based), capped at `retry_max_ms`
    pub fn retry_delay(&self, attempt: u32) -> StdDuration {
        let factor = self
            .retry_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let millis = (self.retry_base_ms as f64 * factor).min(self.retry_max_ms as f64);
        StdDuration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::new();
        config.validate().unwrap();
        assert_eq!(config.protocol.interval_secs, 600);
        assert_eq!(config.protocol.intervals_per_epoch, 144);
        assert_eq!(config.protocol.retention_days, 14);
        assert_eq!(config.protocol.coalescing_window_secs, 300);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "protocol": { "retention_days": 21 } }"#).unwrap();
        assert_eq!(config.protocol.retention_days, 21);
        assert_eq!(config.protocol.interval_secs, 600);
        assert_eq!(config.retention_sweep_secs, 3600);
        assert_eq!(config.matching.min_exposure_windows, 3);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = EngineConfig::new()
            .with_protocol(ProtocolConfig::new().with_interval_length(StdDuration::ZERO));
        let err = config.validate().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_validate_rejects_unbounded_windows() {
        let config =
            EngineConfig::new().with_protocol(ProtocolConfig::new().with_retention_days(u32::MAX));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ProxiError::InvalidConfig { ref field, .. } if field == "protocol.retention_days"));

        let config: EngineConfig =
            serde_json::from_str(r#"{ "matching": { "clock_tolerance_secs": 18446744073709551615 } }"#)
                .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ProxiError::InvalidConfig { ref field, .. } if field == "matching.clock_tolerance_secs"));

        let config = EngineConfig::new()
            .with_protocol(ProtocolConfig::new().with_retention_days(MAX_RETENTION_DAYS));
        config.validate().unwrap();
    }

    #[test]
    fn test_interval_and_epoch_math() {
        let protocol = ProtocolConfig::default();
        let start = protocol.interval_start(100);
        assert_eq!(start.timestamp(), 60_000);
        assert_eq!(protocol.interval_at(start), 100);
        assert_eq!(protocol.interval_at(start + Duration::seconds(599)), 100);
        assert_eq!(protocol.interval_at(start + Duration::seconds(600)), 101);

        assert_eq!(protocol.epoch_of(143), 0);
        assert_eq!(protocol.epoch_of(144), 1);
        assert_eq!(protocol.epoch_start_interval(2), 288);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let radio = RadioConfig::default();
        assert_eq!(radio.retry_delay(0), StdDuration::from_millis(500));
        assert_eq!(radio.retry_delay(1), StdDuration::from_millis(1000));
        assert_eq!(radio.retry_delay(3), StdDuration::from_millis(4000));
        assert_eq!(radio.retry_delay(20), StdDuration::from_millis(30_000));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "radio": { "scan_interval_secs": 30 } }"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.radio.scan_interval_secs, 30);
        assert!(EngineConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
