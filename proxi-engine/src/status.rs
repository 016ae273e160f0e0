//! Engine state, status document and notifications

use std::fmt;

use chrono::{DateTime, Utc};
use proxi_core::{ErrorDetail, ExposureEvent, ProxiError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Controller lifecycle
///
/// `Stopped → Starting → Running → Stopped`, with
/// `Running → CheckingExposure → Running` while a matching pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    CheckingExposure,
}

impl EngineState {
    /// Broadcast and scan may be active
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::CheckingExposure)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::CheckingExposure => "checking_exposure",
        };
        f.write_str(name)
    }
}

/// What the device knows about its own exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfectionStatus {
    Healthy,
    /// At least one unacknowledged exposure event
    Exposed,
    /// The user reported a positive diagnosis
    Infected,
}

/// Conditions that currently keep tracing from working
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorState {
    RadioUnavailable,
    RadioRetriesExhausted,
    KeyGeneration,
    Storage,
}

impl ErrorState {
    pub fn from_error(err: &ProxiError) -> Option<Self> {
        match err {
            ProxiError::RadioUnavailable { .. } => Some(ErrorState::RadioUnavailable),
            ProxiError::RadioRetriesExhausted { .. } => Some(ErrorState::RadioRetriesExhausted),
            ProxiError::KeyGeneration { .. } => Some(ErrorState::KeyGeneration),
            ProxiError::StorageLocked | ProxiError::Io { .. } => Some(ErrorState::Storage),
            _ => None,
        }
    }
}

/// Last known engine status, readable without waiting on the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub advertising: bool,
    pub receiving: bool,
    pub session_id: Option<Uuid>,
    /// Interval of the identifier being broadcast
    pub current_interval: Option<u32>,
    pub contact_count: usize,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub infection_status: InfectionStatus,
    /// Epochs of exposure events not yet acknowledged
    pub exposure_epochs: Vec<u32>,
    pub errors: Vec<ErrorState>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: EngineState::Stopped,
            advertising: false,
            receiving: false,
            session_id: None,
            current_interval: None,
            contact_count: 0,
            last_evaluation: None,
            infection_status: InfectionStatus::Healthy,
            exposure_epochs: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Events pushed to every subscriber
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    StateChanged { state: EngineState },
    ExposureDetected { event: ExposureEvent },
    /// A fatal error stopped the engine; sent once per occurrence
    Fault { error: ErrorDetail },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let status = EngineStatus {
            state: EngineState::CheckingExposure,
            errors: vec![ErrorState::RadioUnavailable],
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "checking_exposure");
        assert_eq!(json["infection_status"], "healthy");
        assert_eq!(json["errors"][0], "radio_unavailable");
    }

    #[test]
    fn test_error_states() {
        let err = ProxiError::KeyGeneration {
            reason: "no entropy".to_string(),
        };
        assert_eq!(ErrorState::from_error(&err), Some(ErrorState::KeyGeneration));

        let err = ProxiError::InvalidKeyFormat {
            reason: "short".to_string(),
        };
        assert_eq!(ErrorState::from_error(&err), None);
    }
}
