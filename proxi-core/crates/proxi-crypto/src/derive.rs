use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::key::{RollingProximityIdentifier, TracingKey, KEY_LEN};

const RPIK_INFO: &[u8] = b"EN-RPIK";
const RPI_PREFIX: &[u8; 6] = b"EN-RPI";

/// Identifier key expanded from a tracing key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RpiKey([u8; KEY_LEN]);

impl RpiKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Expand a tracing key into its identifier key
pub fn derive_rpi_key(key: &TracingKey) -> RpiKey {
    let hk = Hkdf::<Sha256>::new(None, key.as_bytes());
    let mut out = [0u8; KEY_LEN];
    hk.expand(RPIK_INFO, &mut out)
        .expect("16 bytes is valid for HKDF-SHA256");
    RpiKey(out)
}

fn padded_data(interval: u32) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..6].copy_from_slice(RPI_PREFIX);
    block[12..].copy_from_slice(&interval.to_le_bytes());
    block
}

/// Derive the identifier a key broadcasts during `interval`
///
/// Pure and deterministic. Use [`RpiDeriver`] when deriving many intervals
/// from the same key.
pub fn derive_rpi(key: &TracingKey, interval: u32) -> RollingProximityIdentifier {
    RpiDeriver::new(key).derive(interval)
}

/// Derives identifiers for one key with the AES schedule expanded once
pub struct RpiDeriver {
    cipher: Aes128,
}

impl RpiDeriver {
    pub fn new(key: &TracingKey) -> Self {
        let rpik = derive_rpi_key(key);
        let cipher = Aes128::new(rpik.as_bytes().into());
        Self { cipher }
    }

    pub fn derive(&self, interval: u32) -> RollingProximityIdentifier {
        let mut block = padded_data(interval).into();
        self.cipher.encrypt_block(&mut block);
        let mut out = [0u8; 16];
        out.copy_from_slice(&block);
        RollingProximityIdentifier::from_bytes(out)
    }
}
