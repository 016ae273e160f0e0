//! Signal strength samples and the distance model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SignalModel;

/// One received-signal measurement of a peer advertisement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    pub rssi_dbm: i16,

    /// Calibrated one-meter power advertised by the peer, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_power_dbm: Option<i16>,
}

impl SignalSample {
    pub fn new(rssi_dbm: i16) -> Self {
        Self {
            rssi_dbm,
            tx_power_dbm: None,
        }
    }

    pub fn with_tx_power(mut self, tx_power_dbm: i16) -> Self {
        self.tx_power_dbm = Some(tx_power_dbm);
        self
    }

    /// Path loss beyond one meter, in dB
    pub fn attenuation_db(&self, model: &SignalModel) -> f64 {
        let reference = self
            .tx_power_dbm
            .map(f64::from)
            .unwrap_or(model.reference_tx_power_dbm);
        reference - f64::from(self.rssi_dbm)
    }

    /// Log-distance estimate: `d = 10 ^ (attenuation / (10 * n))`
    pub fn distance_m(&self, model: &SignalModel) -> f64 {
        10f64.powf(self.attenuation_db(model) / (10.0 * model.path_loss_exponent))
    }
}

/// A sample as kept inside a contact record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub at: DateTime<Utc>,
    pub attenuation_db: f64,
    pub distance_m: f64,
}

impl Sighting {
    pub fn from_sample(at: DateTime<Utc>, sample: &SignalSample, model: &SignalModel) -> Self {
        Self {
            at,
            attenuation_db: sample.attenuation_db(model),
            distance_m: sample.distance_m(model),
        }
    }
}

/// Median of a set of distances; `None` when empty
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
