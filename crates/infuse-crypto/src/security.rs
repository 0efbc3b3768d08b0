//! Device and network root keys

use std::path::Path;

use anyhow::Context;
use secrecy::SecretString;
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use infuse_core::config::DeviceConfig;

use crate::keys::{derive_chacha_key, KeyMaterial};
use crate::KEY_SIZE;

/// Salt used for the device signing key derivation.
const SIGN_KEY_SALT: u32 = 0x1234;

/// A network root key and its 24-bit identifier.
#[derive(Debug, Clone)]
pub struct NetworkRoot {
    pub id: u32,
    pub key: KeyMaterial,
}

impl NetworkRoot {
    pub fn new(id: u32, key: KeyMaterial) -> Self {
        NetworkRoot {
            id: id & 0x00FF_FFFF,
            key,
        }
    }
}

/// Root key material for one device.
pub struct SecurityContext {
    device_public: [u8; KEY_SIZE],
    cloud_public: [u8; KEY_SIZE],
    device_root: KeyMaterial,
    device_sign: KeyMaterial,
    device_key_id: u32,
    network: NetworkRoot,
    secondary: Option<NetworkRoot>,
}

/// 24-bit device key identifier: CRC32 over both public keys.
pub fn device_key_identifier(cloud_public: &[u8; KEY_SIZE], device_public: &[u8; KEY_SIZE]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(cloud_public);
    hasher.update(device_public);
    hasher.finalize() & 0x00FF_FFFF
}

impl SecurityContext {
    /// Compute the device root from the ECDH shared secret with the cloud.
    pub fn init(
        device_secret: [u8; KEY_SIZE],
        cloud_public: [u8; KEY_SIZE],
        network: NetworkRoot,
        secondary: Option<NetworkRoot>,
    ) -> anyhow::Result<Self> {
        let secret = StaticSecret::from(device_secret);
        let device_public = PublicKey::from(&secret).to_bytes();
        let shared = secret.diffie_hellman(&PublicKey::from(cloud_public));
        if !shared.was_contributory() {
            anyhow::bail!("cloud public key produced a non-contributory shared secret");
        }
        let device_root = KeyMaterial::from_bytes(*shared.as_bytes());
        let device_sign = derive_chacha_key(&device_root, &SIGN_KEY_SALT.to_le_bytes(), b"sign")
            .context("deriving signing key")?;
        let device_key_id = device_key_identifier(&cloud_public, &device_public);

        info!(
            device_key_id = %format!("{device_key_id:06X}"),
            network_id = %format!("{:06X}", network.id),
            "security initialised"
        );
        Ok(SecurityContext {
            device_public,
            cloud_public,
            device_root,
            device_sign,
            device_key_id,
            network,
            secondary,
        })
    }

    /// Build the context from `[device]` configuration.
    ///
    /// Without a secret file a fresh ephemeral device secret is generated.
    pub fn from_config(config: &DeviceConfig) -> anyhow::Result<Self> {
        let network_key = config
            .network_key
            .as_ref()
            .context("device.network_key not configured")?;
        let network = NetworkRoot::new(
            config.network_id,
            KeyMaterial::from_base64(&SecretString::from(network_key.clone()))
                .context("loading network root")?,
        );

        let secondary = match (config.secondary_network_id, &config.secondary_network_key) {
            (Some(id), Some(key)) => Some(NetworkRoot::new(
                id,
                KeyMaterial::from_base64(&SecretString::from(key.clone()))
                    .context("loading secondary network root")?,
            )),
            (None, None) => None,
            _ => anyhow::bail!("secondary network requires both an id and a key"),
        };

        let cloud_public = match &config.cloud_public_key {
            Some(encoded) => *KeyMaterial::from_base64(&SecretString::from(encoded.clone()))
                .context("loading cloud public key")?
                .as_bytes(),
            None => anyhow::bail!("device.cloud_public_key not configured"),
        };

        let device_secret = match &config.device_secret_file {
            Some(path) => load_secret_file(path)?,
            None => {
                warn!("no device secret file configured, using an ephemeral device key");
                *crate::keys::generate_key().as_bytes()
            }
        };

        Self::init(device_secret, cloud_public, network, secondary)
    }

    pub fn device_public_key(&self) -> [u8; KEY_SIZE] {
        self.device_public
    }

    pub fn cloud_public_key(&self) -> [u8; KEY_SIZE] {
        self.cloud_public
    }

    pub fn device_root_key(&self) -> &KeyMaterial {
        &self.device_root
    }

    pub fn device_sign_key(&self) -> &KeyMaterial {
        &self.device_sign
    }

    pub fn device_key_identifier(&self) -> u32 {
        self.device_key_id
    }

    pub fn network_root_key(&self) -> &KeyMaterial {
        &self.network.key
    }

    pub fn network_key_identifier(&self) -> u32 {
        self.network.id
    }

    pub fn secondary_network(&self) -> Option<&NetworkRoot> {
        self.secondary.as_ref()
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("device_key_id", &format_args!("{:06X}", self.device_key_id))
            .field("network_id", &format_args!("{:06X}", self.network.id))
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

fn load_secret_file(path: &Path) -> anyhow::Result<[u8; KEY_SIZE]> {
    let mut raw = std::fs::read(path)
        .with_context(|| format!("reading device secret: {}", path.display()))?;
    if raw.len() != KEY_SIZE {
        let len = raw.len();
        raw.zeroize();
        anyhow::bail!("device secret has wrong size: {len} bytes (expected {KEY_SIZE})");
    }
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&raw);
    raw.zeroize();
    Ok(out)
}
