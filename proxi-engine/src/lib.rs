//! # Proxi Engine - tracing on tokio
//!
//! Runs the protocol core against a radio: a [`RadioSession`] advertises the
//! current identifier and scans for peers, while the controller behind
//! [`EngineHandle`] serializes start, stop, evaluation and data management.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use proxi_core::SignalModel;
//! use proxi_engine::{EngineBuilder, SimulatedAir};
//!
//! # async fn run() -> proxi_engine::Result<()> {
//! let air = SimulatedAir::new(SignalModel::default());
//! let engine = EngineBuilder::new(Arc::new(air.radio())).launch().await?;
//!
//! engine.start(true, true).await?;
//! println!("{:?}", engine.status().state);
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod error;
pub mod radio;
pub mod session;
pub mod status;
pub mod timer;

pub use controller::{EngineBuilder, EngineHandle, PruneSummary};
pub use error::{EngineError, Result};
pub use radio::{Observation, RadioDriver, RadioFault, ScanStream, SimulatedAir, SimulatedRadio};
pub use session::{Duties, RadioSession, SessionFault, SessionWiring};
pub use status::{EngineState, EngineStatus, ErrorState, InfectionStatus, Notification};
pub use timer::{RuntimeClock, TokioTimerBackend};
