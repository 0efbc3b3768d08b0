//! Version 0 encrypted frame formats
//!
//! ```text
//! Versioned (serial, bt_adv), 23 byte header:
//!   0   version  u8 = 0        ─┐
//!   1   type     u8             │
//!   2   flags    u16            │ associated data
//!   4   key_id   u24            │
//!   7   dev_hi   u32           ─┘
//!   11  dev_lo   u32           ─┐
//!   15  gps_time u32            │ nonce
//!   19  sequence u16            │
//!   21  entropy  u16           ─┘
//!   23  ciphertext .. tag[16]
//!
//! Unversioned (udp) drops the version byte, 22 byte header.
//! ```

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use infuse_core::types::DeviceId;
use infuse_core::{InfuseError, InfuseResult};
use infuse_crypto::{KeyInterface, KeyManager, KeyType, NONCE_SIZE, TAG_SIZE};

use crate::packet::{
    Auth, RxMetadata, RxPacket, TxMetadata, FLAGS_ENCRYPTION_DEVICE, FLAGS_ENCRYPTION_NETWORK,
};

pub const SECONDS_PER_DAY: u64 = 86_400;

/// Key rotation for a packet sent at `gps_seconds`.
pub fn key_rotation(gps_seconds: u64) -> u32 {
    (gps_seconds / SECONDS_PER_DAY) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Versioned,
    Unversioned,
}

impl FrameFormat {
    pub fn associated_data_size(self) -> usize {
        match self {
            FrameFormat::Versioned => 11,
            FrameFormat::Unversioned => 10,
        }
    }

    pub fn header_size(self) -> usize {
        self.associated_data_size() + NONCE_SIZE
    }

    /// Bytes added to a payload by encryption.
    pub fn overhead(self) -> usize {
        self.header_size() + TAG_SIZE
    }
}

/// Decoded v0 frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V0Header {
    pub packet_type: u8,
    pub flags: u16,
    pub key_identifier: u32,
    pub device_id: DeviceId,
    pub gps_time: u32,
    pub sequence: u16,
    pub entropy: u16,
}

impl V0Header {
    pub fn associated_data(&self, format: FrameFormat) -> Vec<u8> {
        let mut ad = Vec::with_capacity(format.associated_data_size());
        if format == FrameFormat::Versioned {
            ad.push(0);
        }
        ad.push(self.packet_type);
        ad.extend_from_slice(&self.flags.to_le_bytes());
        ad.extend_from_slice(&self.key_identifier.to_le_bytes()[..3]);
        ad.extend_from_slice(&((self.device_id >> 32) as u32).to_le_bytes());
        ad
    }

    pub fn nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..4].copy_from_slice(&(self.device_id as u32).to_le_bytes());
        nonce[4..8].copy_from_slice(&self.gps_time.to_le_bytes());
        nonce[8..10].copy_from_slice(&self.sequence.to_le_bytes());
        nonce[10..12].copy_from_slice(&self.entropy.to_le_bytes());
        nonce
    }

    pub fn encode(&self, format: FrameFormat) -> Vec<u8> {
        let mut out = self.associated_data(format);
        out.extend_from_slice(&self.nonce());
        out
    }

    /// Parse the header from the start of `raw`. Checks length and version only.
    pub fn decode(format: FrameFormat, raw: &[u8]) -> Option<Self> {
        if raw.len() < format.header_size() {
            return None;
        }
        let raw = match format {
            FrameFormat::Versioned => {
                if raw[0] != 0 {
                    return None;
                }
                &raw[1..]
            }
            FrameFormat::Unversioned => raw,
        };
        let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let device_upper = u32_at(6) as u64;
        let device_lower = u32_at(10) as u64;
        Some(V0Header {
            packet_type: raw[0],
            flags: u16::from_le_bytes([raw[1], raw[2]]),
            key_identifier: u32::from_le_bytes([raw[3], raw[4], raw[5], 0]),
            device_id: (device_upper << 32) | device_lower,
            gps_time: u32_at(14),
            sequence: u16::from_le_bytes([raw[18], raw[19]]),
            entropy: u16::from_le_bytes([raw[20], raw[21]]),
        })
    }
}

/// Encrypts and decrypts v0 frames for one interface.
pub struct V0Codec {
    format: FrameFormat,
    interface: KeyInterface,
    keys: Arc<KeyManager>,
    device_id: DeviceId,
    sequence: AtomicU16,
}

impl V0Codec {
    pub fn new(
        format: FrameFormat,
        interface: KeyInterface,
        keys: Arc<KeyManager>,
        device_id: DeviceId,
    ) -> Self {
        V0Codec {
            format,
            interface,
            keys,
            device_id,
            sequence: AtomicU16::new(0),
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn key_interface(&self) -> KeyInterface {
        self.interface
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Seal `payload` into a frame. Updates the encryption flag and sequence
    /// number in `meta`. Remote-encrypted payloads pass through untouched.
    pub fn encrypt(
        &self,
        meta: &mut TxMetadata,
        gps_seconds: u64,
        payload: &[u8],
    ) -> InfuseResult<Vec<u8>> {
        if meta.auth == Auth::RemoteEncrypted {
            return Ok(payload.to_vec());
        }
        let security = self.keys.security();
        let (key_type, key_identifier) = if meta.auth == Auth::Network {
            meta.flags = (meta.flags & !FLAGS_ENCRYPTION_DEVICE) | FLAGS_ENCRYPTION_NETWORK;
            (KeyType::Network, security.network_key_identifier())
        } else {
            meta.flags |= FLAGS_ENCRYPTION_DEVICE;
            (KeyType::Device, security.device_key_identifier())
        };

        let handle = self
            .keys
            .key_get(key_type, self.interface, key_identifier, key_rotation(gps_seconds))
            .ok_or(InfuseError::NotFound)?;

        let header = V0Header {
            packet_type: meta.packet_type,
            flags: meta.flags,
            key_identifier,
            device_id: self.device_id,
            gps_time: gps_seconds as u32,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            entropy: rand::random(),
        };
        let ad = header.associated_data(self.format);
        let nonce = header.nonce();
        let ciphertext = self.keys.encrypt(handle, &nonce, &ad, payload)?;

        let mut frame = Vec::with_capacity(self.format.header_size() + ciphertext.len());
        frame.extend_from_slice(&ad);
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        meta.sequence = header.sequence;
        Ok(frame)
    }

    /// Open a received frame. Failures keep the original bytes with
    /// [`Auth::Failure`].
    pub fn decrypt(&self, raw: Vec<u8>) -> RxPacket {
        if raw.len() <= self.format.overhead() {
            debug!(len = raw.len(), "frame too short");
            return RxPacket::failed(raw);
        }
        let Some(header) = V0Header::decode(self.format, &raw) else {
            debug!("unsupported frame version");
            return RxPacket::failed(raw);
        };

        let mut meta = RxMetadata {
            auth: Auth::Failure,
            packet_type: header.packet_type,
            flags: header.flags,
            sequence: header.sequence,
            key_identifier: header.key_identifier,
            packet_gps_time: header.gps_time,
            packet_device_id: header.device_id,
            ..RxMetadata::default()
        };

        let (key_type, auth) = if header.flags & FLAGS_ENCRYPTION_DEVICE != 0 {
            if header.device_id != self.device_id {
                debug!(device_id = %format!("{:016X}", header.device_id), "device packet for another device");
                return RxPacket { meta, payload: raw };
            }
            (KeyType::Device, Auth::Device)
        } else {
            (KeyType::Network, Auth::Network)
        };

        let rotation = key_rotation(header.gps_time as u64);
        let Some(handle) = self
            .keys
            .key_get(key_type, self.interface, header.key_identifier, rotation)
        else {
            debug!(key_id = %format!("{:06X}", header.key_identifier), "no key for frame");
            return RxPacket { meta, payload: raw };
        };

        let header_size = self.format.header_size();
        let ad = &raw[..self.format.associated_data_size()];
        match self
            .keys
            .decrypt(handle, &header.nonce(), ad, &raw[header_size..])
        {
            Ok(payload) => {
                meta.auth = auth;
                RxPacket { meta, payload }
            }
            Err(e) => {
                warn!(interface = self.interface.info(), error = %e, "frame authentication failed");
                RxPacket { meta, payload: raw }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use infuse_crypto::{KeyManager, KeyMaterial, NetworkRoot, SecurityContext};
    use x25519_dalek::{PublicKey, StaticSecret};

    pub const NET_ID: u32 = 0x00AB_CDEF;
    pub const DEVICE_ID: u64 = 0x0123_4567_89AB_CDEF;

    pub fn key_manager() -> Arc<KeyManager> {
        let cloud_public = PublicKey::from(&StaticSecret::from([0x11u8; 32])).to_bytes();
        let ctx = SecurityContext::init(
            [0x22u8; 32],
            cloud_public,
            NetworkRoot::new(NET_ID, KeyMaterial::from_bytes([0x33; 32])),
            None,
        )
        .unwrap();
        Arc::new(KeyManager::new(Arc::new(ctx)))
    }
}
