//! Radio driver seam
//!
//! [`RadioDriver`] is the only thing the engine knows about the short-range
//! radio. A platform binding implements it over the OS Bluetooth stack;
//! [`SimulatedAir`] implements it in-process for tests and the simulator.
//!
//! ```text
//! ┌────────────────────────────┐
//! │        RadioSession        │
//! │  advertise duty  scan duty │
//! └─────────────┬──────────────┘
//!               ▼
//! ┌────────────────────────────┐
//! │     RadioDriver (trait)    │
//! ├──────────────┬─────────────┤
//! │  platform    │ Simulated   │
//! │  binding     │ Radio       │
//! └──────────────┴─────────────┘
//! ```

mod simulated;

pub use simulated::{SimulatedAir, SimulatedRadio};

use async_trait::async_trait;
use proxi_core::{RollingProximityIdentifier, SignalSample};
use thiserror::Error;
use tokio::sync::mpsc;

/// A peer advertisement picked up by the scanner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub identifier: RollingProximityIdentifier,
    pub sample: SignalSample,
}

/// Faults reported by a radio driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioFault {
    /// Temporary failure; the same call may succeed later
    #[error("transient radio fault: {0}")]
    Transient(String),

    /// The platform refused the capability (permission, radio off)
    #[error("radio capability denied: {0}")]
    Denied(String),
}

/// Stream of scan results; a `Denied` item or a closed channel ends the scan
pub type ScanStream = mpsc::Receiver<Result<Observation, RadioFault>>;

/// Platform radio operations used by a radio session
///
/// `start_advertising` while already advertising swaps the payload in place
/// without pausing the broadcast.
#[async_trait]
pub trait RadioDriver: Send + Sync {
    /// Check that advertising and scanning are currently permitted
    async fn check_capability(&self) -> Result<(), RadioFault>;

    async fn start_advertising(&self, identifier: RollingProximityIdentifier) -> Result<(), RadioFault>;

    async fn stop_advertising(&self) -> Result<(), RadioFault>;

    async fn start_scan(&self) -> Result<ScanStream, RadioFault>;

    async fn stop_scan(&self) -> Result<(), RadioFault>;

    /// Driver name (for logging)
    fn name(&self) -> &'static str;
}
