//! # Proxi Core - decentralized proximity tracing
//!
//! Devices broadcast short-lived identifiers derived from a secret per-day
//! key, remember the identifiers they hear, and later check locally whether
//! any of them came from a key that a diagnosed party chose to publish. No
//! central party learns who met whom.
//!
//! - **KeyMaterial**: one random tracing key per epoch, persisted, exportable
//!   as diagnosis keys
//! - **IdentifierRotator**: the broadcast identifier for the current interval,
//!   rotated without gaps at every interval boundary
//! - **ContactStore**: coalesced sightings of peer identifiers with distance
//!   estimates, pruned by retention
//! - **ExposureMatcher**: re-derives the identifiers of published keys and
//!   intersects them with a contact snapshot
//!
//! Radio sessions and the start/stop controller live in `proxi-engine`.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{DateTime, Duration, Utc};
//! use proxi_core::{
//!     ContactStore, EngineConfig, InMemoryStorage, KeyMaterial, ManualClock, SignalSample,
//! };
//!
//! let config = EngineConfig::new();
//! let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
//! let clock = Arc::new(ManualClock::new(start));
//!
//! // the other device's key material
//! let theirs = KeyMaterial::new(config.protocol.clone(), Arc::new(InMemoryStorage::new()), clock.clone()).unwrap();
//! let (epoch, key) = theirs.key_for_now().unwrap();
//! let interval = config.protocol.interval_at(start);
//! let heard = KeyMaterial::derive_rpi(&key, interval);
//!
//! // our contact history
//! let contacts = ContactStore::new(
//!     config.protocol.clone(),
//!     config.signal.clone(),
//!     Arc::new(InMemoryStorage::new()),
//!     clock.clone(),
//! )
//! .unwrap();
//! for minute in 0..3 {
//!     contacts.record(heard, start + Duration::minutes(minute), SignalSample::new(-65)).unwrap();
//! }
//!
//! let snapshot = contacts.snapshot();
//! let record = snapshot.probe(&heard).next().unwrap();
//! assert_eq!(record.sample_count, 3);
//! assert_eq!(theirs.export_diagnosis_keys(epoch..=epoch).len(), 1);
//! ```

pub mod clock;
pub mod config;
pub mod contacts;
pub mod error;
pub mod keys;
pub mod matcher;
pub mod rotator;
pub mod storage;
pub mod timing;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, MatchingConfig, ProtocolConfig, RadioConfig, SignalModel};
pub use contacts::{
    ContactKey, ContactQuery, ContactRecord, ContactSnapshot, ContactStore, RecordOutcome,
    SignalSample, Sighting,
};
pub use error::{ErrorCategory, ErrorDetail, ErrorResponse, ProxiError, Result};
pub use keys::{KeyMaterial, StoredKey};
pub use matcher::{
    DiagnosisKey, ExposureEvent, ExposureMatcher, MatchReport, PublishedKey, RejectedKey,
};
pub use rotator::{CurrentIdentifier, IdentifierRotator, RotatorState};
pub use storage::{EngineSettings, FileStorage, InMemoryStorage, NullStorage, StorageBackend};
pub use timing::{TimerBackend, TimerEvent};

pub use proxi_crypto::{KeySource, OsKeySource, RollingProximityIdentifier, TracingKey};

/// Crate version, reported by the CLI and the engine status
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
