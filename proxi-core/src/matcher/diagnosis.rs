//! Diagnosis keys as published and as validated

use std::ops::Range;

use proxi_crypto::TracingKey;
use serde::{Deserialize, Serialize};

use crate::config::ProtocolConfig;
use crate::error::{ProxiError, Result};

/// Diagnosis key in its published wire form
///
/// Nothing here is trusted; [`DiagnosisKey::parse`] validates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedKey {
    /// Hex-encoded 16-byte tracing key
    pub key_data: String,
    pub rolling_start_interval: u32,
    pub rolling_period: u32,
}

/// A validated diagnosis key
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosisKey {
    pub key: TracingKey,
    pub rolling_start_interval: u32,
    pub rolling_period: u32,
}

impl DiagnosisKey {
    /// Validate a published key against the protocol's epoch layout
    pub fn parse(published: &PublishedKey, protocol: &ProtocolConfig) -> Result<Self> {
        let key = TracingKey::from_hex(&published.key_data).map_err(|e| {
            ProxiError::InvalidKeyFormat {
                reason: format!("key_data: {}", e),
            }
        })?;

        let per_epoch = protocol.intervals_per_epoch;
        if published.rolling_period == 0 || published.rolling_period > per_epoch {
            return Err(ProxiError::InvalidKeyFormat {
                reason: format!(
                    "rolling_period {} outside 1..={}",
                    published.rolling_period, per_epoch
                ),
            });
        }
        if published.rolling_start_interval % per_epoch != 0 {
            return Err(ProxiError::InvalidKeyFormat {
                reason: format!(
                    "rolling_start_interval {} is not aligned to an epoch",
                    published.rolling_start_interval
                ),
            });
        }
        if published
            .rolling_start_interval
            .checked_add(published.rolling_period)
            .is_none()
        {
            return Err(ProxiError::InvalidKeyFormat {
                reason: "validity range overflows".to_string(),
            });
        }

        Ok(Self {
            key,
            rolling_start_interval: published.rolling_start_interval,
            rolling_period: published.rolling_period,
        })
    }

    pub fn to_published(&self) -> PublishedKey {
        PublishedKey {
            key_data: self.key.to_hex(),
            rolling_start_interval: self.rolling_start_interval,
            rolling_period: self.rolling_period,
        }
    }

    pub fn epoch(&self, protocol: &ProtocolConfig) -> u32 {
        protocol.epoch_of(self.rolling_start_interval)
    }

    /// Intervals during which this key was broadcasting
    pub fn intervals(&self) -> Range<u32> {
        self.rolling_start_interval..self.rolling_start_interval + self.rolling_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published(key_data: &str, start: u32, period: u32) -> PublishedKey {
        PublishedKey {
            key_data: key_data.to_string(),
            rolling_start_interval: start,
            rolling_period: period,
        }
    }

    #[test]
    fn test_parse_valid_key() {
        let protocol = ProtocolConfig::default();
        let key = DiagnosisKey::parse(&published(&"ab".repeat(16), 288, 144), &protocol).unwrap();
        assert_eq!(key.epoch(&protocol), 2);
        assert_eq!(key.intervals(), 288..432);
        assert_eq!(key.to_published().key_data, "ab".repeat(16));
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        let protocol = ProtocolConfig::default();
        let cases = [
            published("abcd", 0, 144),
            published("not hex at all", 0, 144),
            published(&"ab".repeat(16), 0, 0),
            published(&"ab".repeat(16), 0, 145),
            published(&"ab".repeat(16), 7, 144),
        ];
        for case in &cases {
            let err = DiagnosisKey::parse(case, &protocol).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_KEY_FORMAT", "{:?}", case);
        }
    }

    #[test]
    fn test_published_key_json_shape() {
        let json = r#"{"key_data":"00112233445566778899aabbccddeeff","rolling_start_interval":144,"rolling_period":144}"#;
        let key: PublishedKey = serde_json::from_str(json).unwrap();
        assert_eq!(key.rolling_start_interval, 144);
        assert!(DiagnosisKey::parse(&key, &ProtocolConfig::default()).is_ok());
    }
}
