//! Error types for proximity tracing operations
//!
//! Every variant carries:
//! - A human-readable message with a hint for the host application
//! - A stable error code for programmatic handling
//! - A category for grouping
//!
//! # Fatal vs. local errors
//!
//! `KeyGeneration`, `RadioUnavailable` and `RadioRetriesExhausted` are fatal:
//! the engine stops and reports them once. `InvalidKeyFormat` is local to a
//! single diagnosis key and never aborts a matching pass.
//!
//! # Example
//!
//! ```rust
//! use proxi_core::error::{ErrorCategory, ProxiError};
//!
//! fn handle_error(err: ProxiError) {
//!     match err.category() {
//!         ErrorCategory::Capability => println!("ask the user to enable the radio"),
//!         ErrorCategory::Validation => println!("bad input: {}", err),
//!         _ => println!("other error"),
//!     }
//!
//!     if err.is_fatal() {
//!         println!("engine stopped: {}", err.error_code());
//!     }
//! }
//! ```

use proxi_crypto::CryptoError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for proximity tracing operations
pub type Result<T> = std::result::Result<T, ProxiError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Key material could not be produced
    KeyMaterial,
    /// Platform capability missing or revoked
    Capability,
    /// Temporary condition, retry may succeed
    Transient,
    /// Input validation failed
    Validation,
    /// Persistence layer failed
    Storage,
    /// Bug or broken invariant
    Internal,
}

/// Errors that can occur in proximity tracing operations
#[derive(Error, Debug)]
pub enum ProxiError {
    // ═══════════════════════════════════════════════════════════════════════
    // Key material
    // ═══════════════════════════════════════════════════════════════════════

    /// The secure random source could not produce a tracing key
    #[error("Key generation failed: {reason}. Tracing cannot start without key material.")]
    KeyGeneration { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Radio
    // ═══════════════════════════════════════════════════════════════════════

    /// The platform denied the radio capability or the radio is off
    #[error("Radio unavailable: {reason}. Grant Bluetooth/location access and start again.")]
    RadioUnavailable { reason: String },

    /// A transient radio fault kept recurring until the retry budget ran out
    #[error("Radio {duty} failed after {attempts} attempts: {reason}")]
    RadioRetriesExhausted {
        duty: String,
        attempts: u32,
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Matching input and configuration
    // ═══════════════════════════════════════════════════════════════════════

    /// A published diagnosis key is malformed
    #[error("Invalid diagnosis key: {reason}")]
    InvalidKeyFormat { reason: String },

    /// A configuration value is out of range
    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Infrastructure errors (serialization, storage, I/O)
    // ═══════════════════════════════════════════════════════════════════════

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage backend lock is poisoned
    #[error("Storage backend lock poisoned. This is a bug; please report it.")]
    StorageLocked,

    /// I/O operation failed
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal error that shouldn't happen
    #[error("Internal error: {reason}. This is a bug; please report it.")]
    Internal { reason: String },
}

impl ProxiError {
    /// Returns true if this error might succeed on retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxiError::StorageLocked
                | ProxiError::Io { .. }
                | ProxiError::RadioRetriesExhausted { .. }
        )
    }

    /// Returns true if this error must stop a running engine
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxiError::KeyGeneration { .. }
                | ProxiError::RadioUnavailable { .. }
                | ProxiError::RadioRetriesExhausted { .. }
        )
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProxiError::KeyGeneration { .. } => ErrorCategory::KeyMaterial,

            ProxiError::RadioUnavailable { .. } => ErrorCategory::Capability,

            ProxiError::RadioRetriesExhausted { .. } | ProxiError::StorageLocked => {
                ErrorCategory::Transient
            }

            ProxiError::InvalidKeyFormat { .. }
            | ProxiError::InvalidConfig { .. }
            | ProxiError::Json(_) => ErrorCategory::Validation,

            ProxiError::Io { .. } => ErrorCategory::Storage,

            ProxiError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            ProxiError::KeyGeneration { .. } => "KEY_GENERATION_FAILED",
            ProxiError::RadioUnavailable { .. } => "RADIO_UNAVAILABLE",
            ProxiError::RadioRetriesExhausted { .. } => "RADIO_RETRIES_EXHAUSTED",
            ProxiError::InvalidKeyFormat { .. } => "INVALID_KEY_FORMAT",
            ProxiError::InvalidConfig { .. } => "INVALID_CONFIG",
            ProxiError::Json(_) => "JSON_ERROR",
            ProxiError::StorageLocked => "STORAGE_LOCKED",
            ProxiError::Io { .. } => "IO_ERROR",
            ProxiError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Converts this error to a JSON-serializable response object
    ///
    /// ```json
    /// {
    ///   "error": {
    ///     "code": "RADIO_UNAVAILABLE",
    ///     "message": "Radio unavailable: ...",
    ///     "category": "capability",
    ///     "recoverable": false
    ///   }
    /// }
    /// ```
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

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        ProxiError::Io {
            message: format!("{}: {}", context, err),
        }
    }
}

impl From<CryptoError> for ProxiError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::RandomSourceUnavailable { reason } => ProxiError::KeyGeneration { reason },
            other => ProxiError::InvalidKeyFormat {
                reason: other.to_string(),
            },
        }
    }
}

/// JSON-serializable error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail for JSON responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code (e.g., "RADIO_UNAVAILABLE")
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    /// Whether retry might succeed
    pub recoverable: bool,
}
