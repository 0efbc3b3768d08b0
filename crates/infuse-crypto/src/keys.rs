//! Key material and HKDF-SHA256 derivation

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 256-bit symmetric key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    bytes: [u8; KEY_SIZE],
}

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Decode a base64 encoded 32 byte key.
    pub fn from_base64(encoded: &SecretString) -> anyhow::Result<Self> {
        let mut raw = B64
            .decode(encoded.expose_secret().trim())
            .map_err(|e| anyhow::anyhow!("invalid base64 key: {e}"))?;
        if raw.len() != KEY_SIZE {
            let len = raw.len();
            raw.zeroize();
            anyhow::bail!("key has wrong size: {len} bytes (expected {KEY_SIZE})");
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self { bytes })
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit key.
pub fn generate_key() -> KeyMaterial {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    KeyMaterial::from_bytes(bytes)
}

/// Derive a ChaCha20 key from `base` via HKDF-SHA256.
pub fn derive_chacha_key(
    base: &KeyMaterial,
    salt: &[u8],
    info: &[u8],
) -> anyhow::Result<KeyMaterial> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), base.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(KeyMaterial::from_bytes(okm))
}
