//! Proxi CLI - offline tools for a proxi data directory
//!
//! Usage:
//!     proxi simulate --distance 2 --minutes 40
//!     proxi export-keys --store ./data --days 14 > keys.json
//!     proxi evaluate --store ./data --keys keys.json
//!     proxi prune --store ./data
//!     proxi status --store ./data

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use proxi_core::timing::{MockTimerBackend, ROTATION_TIMER_ID};
use proxi_core::{
    Clock, ContactStore, EngineConfig, ExposureMatcher, FileStorage, IdentifierRotator,
    InMemoryStorage, KeyMaterial, ManualClock, ProxiError, PublishedKey, Result, SignalModel,
    SignalSample, StorageBackend, SystemClock,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "proxi")]
#[command(about = "Offline tools for the proxi tracing engine")]
#[command(version)]
struct Cli {
    /// Engine configuration JSON (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate an encounter between two devices in virtual time
    Simulate {
        /// Distance between the devices in meters
        #[arg(long, default_value_t = 2.0)]
        distance: f64,

        /// Length of the encounter in minutes
        #[arg(long, default_value_t = 40)]
        minutes: u32,

        /// Encounter start as unix seconds (default: now)
        #[arg(long)]
        start: Option<i64>,
    },

    /// Print this device's diagnosis keys as JSON
    ExportKeys {
        #[arg(short, long)]
        store: PathBuf,

        /// Number of past days to export, including today
        #[arg(long, default_value_t = 14)]
        days: u32,
    },

    /// Match published diagnosis keys against the stored contacts
    Evaluate {
        #[arg(short, long)]
        store: PathBuf,

        /// JSON array of published keys
        #[arg(short, long)]
        keys: PathBuf,
    },

    /// Delete keys, contacts and exposures past the retention window
    Prune {
        #[arg(short, long)]
        store: PathBuf,
    },

    /// Summarize a data directory
    Status {
        #[arg(short, long)]
        store: PathBuf,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxi=info,proxi_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        let response = e.to_error_response();
        match serde_json::to_string_pretty(&response) {
            Ok(json) => eprintln!("{}", json),
            Err(_) => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::new(),
    };
    config.validate()?;

    match cli.command {
        Command::Simulate {
            distance,
            minutes,
            start,
        } => simulate(&config, distance, minutes, start),
        Command::ExportKeys { store, days } => export_keys(&config, &store, days),
        Command::Evaluate { store, keys } => evaluate(&config, &store, &keys),
        Command::Prune { store } => prune(&config, &store),
        Command::Status { store } => status(&config, &store),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// RSSI a receiver would see at `distance` under the log-distance model
fn rssi_at(distance: f64, model: &SignalModel) -> i16 {
    let loss = 10.0 * model.path_loss_exponent * distance.max(0.1).log10();
    (model.reference_tx_power_dbm - loss).round() as i16
}

fn simulate(config: &EngineConfig, distance: f64, minutes: u32, start: Option<i64>) -> Result<()> {
    let start = match start {
        Some(secs) => DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| ProxiError::InvalidConfig {
            field: "start".to_string(),
            reason: "timestamp out of range".to_string(),
        })?,
        None => SystemClock.now(),
    };
    let clock = Arc::new(ManualClock::new(start));

    // device A broadcasts
    let timers = Arc::new(MockTimerBackend::new());
    let keys = Arc::new(KeyMaterial::new(
        config.protocol.clone(),
        Arc::new(InMemoryStorage::new()),
        clock.clone(),
    )?);
    let rotator = IdentifierRotator::new(config.protocol.clone(), keys.clone(), timers.clone(), clock.clone());
    rotator.start()?;

    // device B listens
    let contacts = ContactStore::new(
        config.protocol.clone(),
        config.signal.clone(),
        Arc::new(InMemoryStorage::new()),
        clock.clone(),
    )?;
    let sample = SignalSample::new(rssi_at(distance, &config.signal));

    for _ in 0..=minutes {
        let now = clock.now();
        if let Some(current) = rotator.current() {
            if now >= current.valid_until {
                if let Some(event) = timers.take_due(ROTATION_TIMER_ID) {
                    rotator.on_timer(&event)?;
                }
            }
        }
        if let Some(current) = rotator.current() {
            contacts.record(current.identifier, now, sample)?;
        }
        clock.advance(Duration::minutes(1));
    }
    rotator.stop()?;

    // A is diagnosed and publishes every key used during the encounter
    let first = config.protocol.epoch_at(start);
    let last = config.protocol.epoch_at(clock.now());
    let published: Vec<PublishedKey> = keys
        .export_diagnosis_keys(first..=last)
        .iter()
        .map(|k| k.to_published())
        .collect();

    let matcher = ExposureMatcher::new(config.protocol.clone(), config.matching.clone());
    let report = matcher.evaluate(&published, &contacts.snapshot());
    tracing::info!(
        distance_m = distance,
        minutes,
        rssi_dbm = sample.rssi_dbm,
        records = contacts.len(),
        events = report.events.len(),
        "Simulation finished"
    );
    print_json(&report)
}

fn open_store(path: &Path) -> Result<Arc<dyn StorageBackend>> {
    let storage = FileStorage::new(path)?;
    storage.health_check()?;
    Ok(Arc::new(storage))
}

fn export_keys(config: &EngineConfig, store: &Path, days: u32) -> Result<()> {
    let storage = open_store(store)?;
    let keys = KeyMaterial::new(config.protocol.clone(), storage, Arc::new(SystemClock))?;

    let today = config.protocol.epoch_at(SystemClock.now());
    let first = today.saturating_sub(days.saturating_sub(1));
    let published: Vec<PublishedKey> = keys
        .export_diagnosis_keys(first..=today)
        .iter()
        .map(|k| k.to_published())
        .collect();
    print_json(&published)
}

fn evaluate(config: &EngineConfig, store: &Path, keys_file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(keys_file).map_err(|e| ProxiError::Io {
        message: format!("Failed to read {}: {}", keys_file.display(), e),
    })?;
    let published: Vec<PublishedKey> = serde_json::from_str(&raw)?;

    let storage = open_store(store)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let contacts = ContactStore::new(
        config.protocol.clone(),
        config.signal.clone(),
        storage.clone(),
        clock.clone(),
    )?;

    let matcher = ExposureMatcher::new(config.protocol.clone(), config.matching.clone());
    let report = matcher.evaluate(&published, &contacts.snapshot());
    let mut settings = storage.load_settings()?;
    for event in &report.events {
        if !settings.acknowledged_exposures.contains_key(&event.id) {
            storage.upsert_exposure(event)?;
        }
    }

    settings.last_evaluation = Some(clock.now());
    storage.save_settings(&settings)?;

    print_json(&report)
}

fn prune(config: &EngineConfig, store: &Path) -> Result<()> {
    let storage = open_store(store)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let keys = KeyMaterial::new(config.protocol.clone(), storage.clone(), clock.clone())?;
    let contacts = ContactStore::new(
        config.protocol.clone(),
        config.signal.clone(),
        storage.clone(),
        clock.clone(),
    )?;
    let oldest_epoch = config.protocol.epoch_at(clock.now() - config.protocol.retention());

    let summary = serde_json::json!({
        "keys": keys.prune()?,
        "contacts": contacts.prune_expired()?,
        "exposures": storage.delete_exposures_before(oldest_epoch)?,
    });
    print_json(&summary)
}

fn status(config: &EngineConfig, store: &Path) -> Result<()> {
    let storage = open_store(store)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let keys = KeyMaterial::new(config.protocol.clone(), storage.clone(), clock.clone())?;
    let contacts = ContactStore::new(
        config.protocol.clone(),
        config.signal.clone(),
        storage.clone(),
        clock,
    )?;
    let exposures = storage.load_exposures()?;

    let summary = serde_json::json!({
        "version": proxi_core::VERSION,
        "backend": storage.name(),
        "settings": storage.load_settings()?,
        "key_epochs": keys.epochs(),
        "contacts": contacts.len(),
        "exposures": exposures,
    });
    print_json(&summary)
}
