//! Tracing key material and rolling proximity identifier derivation.
//!
//! Keys are 16 random bytes, one per epoch. Identifiers are derived with the
//! Exposure Notification construction:
//!
//! ```text
//! RPIK  = HKDF-SHA256(ikm = TEK, salt = none, info = "EN-RPIK", L = 16)
//! RPI_i = AES-128(RPIK, "EN-RPI" || 0x00 * 6 || i as u32 LE)
//! ```
//!
//! Nothing here performs I/O or keeps state beyond a single key.

mod derive;
mod key;

pub use derive::{derive_rpi, derive_rpi_key, RpiDeriver, RpiKey};
pub use key::{KeySource, OsKeySource, RollingProximityIdentifier, TracingKey, KEY_LEN, RPI_LEN};

use thiserror::Error;

/// Errors raised while creating or decoding key material
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    /// The random source refused to produce bytes
    #[error("Random source unavailable: {reason}")]
    RandomSourceUnavailable { reason: String },

    /// Decoded material has the wrong length
    #[error("Invalid key material length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Material is not valid hex
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Result type alias for key material operations
pub type Result<T> = std::result::Result<T, CryptoError>;
