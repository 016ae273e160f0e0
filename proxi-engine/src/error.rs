//! Error types for the tracing engine

use proxi_core::{ErrorCategory, ErrorDetail, ErrorResponse, ProxiError};
use thiserror::Error;

use crate::status::EngineState;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Error raised by the protocol core
    #[error(transparent)]
    Core(#[from] ProxiError),

    /// The operation needs a stopped engine
    #[error("Engine is {state}; stop it first")]
    EngineNotStopped { state: EngineState },

    /// The controller task is gone
    #[error("Engine has shut down")]
    EngineShutDown,

    /// A background task panicked or was cancelled
    #[error("Background task failed: {reason}")]
    TaskFailed { reason: String },
}

impl EngineError {
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Core(e) => e.error_code(),
            EngineError::EngineNotStopped { .. } => "ENGINE_NOT_STOPPED",
            EngineError::EngineShutDown => "ENGINE_SHUT_DOWN",
            EngineError::TaskFailed { .. } => "TASK_FAILED",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Core(e) => e.category(),
            EngineError::EngineNotStopped { .. } => ErrorCategory::Validation,
            EngineError::EngineShutDown | EngineError::TaskFailed { .. } => ErrorCategory::Internal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Core(e) if e.is_fatal())
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Core(e) => e.is_recoverable(),
            EngineError::EngineNotStopped { .. } => true,
            EngineError::EngineShutDown | EngineError::TaskFailed { .. } => false,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                category: self.category(),
                recoverable: self.is_recoverable(),
            },
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::TaskFailed {
            reason: err.to_string(),
        }
    }
}
