//! Rotating per-interface key cache
//!
//! ```text
//! (key type, interface) -> { rotation, handle }
//!   device    x {serial, udp, bt_adv, bt_gatt}
//!   network   x {serial, udp, bt_adv, bt_gatt}
//!   secondary x {serial, udp, bt_adv, bt_gatt}
//!   extension[i] x {serial, udp, bt_adv, bt_gatt}
//! ```
//!
//! A rotation mismatch destroys the cached key before deriving its
//! replacement, so at most one key per slot is ever alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, error, info};

use infuse_core::{InfuseError, InfuseResult};

use crate::keys::{derive_chacha_key, KeyMaterial};
use crate::security::SecurityContext;
use crate::NONCE_SIZE;

/// Maximum number of extension networks.
pub const EXTENSION_NETWORKS_MAX: usize = 4;

const INTERFACE_NUM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyInterface {
    Serial = 0,
    Udp = 1,
    BtAdv = 2,
    BtGatt = 3,
}

impl KeyInterface {
    /// HKDF info string for this interface.
    pub fn info(self) -> &'static str {
        match self {
            KeyInterface::Serial => "serial",
            KeyInterface::Udp => "udp",
            KeyInterface::BtAdv => "bt_adv",
            KeyInterface::BtGatt => "bt_gatt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Network,
    Device,
}

/// Opaque identifier of a derived key held by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(u32);

#[derive(Debug, Clone, Copy, Default)]
struct KeyStorage {
    rotation: u32,
    handle: Option<KeyHandle>,
}

type SlotSet = [KeyStorage; INTERFACE_NUM];

struct ExtensionNetwork {
    network_id: u32,
    root: KeyMaterial,
    keys: SlotSet,
}

#[derive(Clone, Copy)]
enum Slot {
    Device,
    Network,
    Secondary,
    Extension(usize),
}

struct Inner {
    next_handle: u32,
    store: HashMap<KeyHandle, KeyMaterial>,
    device: SlotSet,
    network: SlotSet,
    secondary: SlotSet,
    extensions: Vec<ExtensionNetwork>,
}

impl Inner {
    fn slots(&mut self, slot: Slot) -> &mut SlotSet {
        match slot {
            Slot::Device => &mut self.device,
            Slot::Network => &mut self.network,
            Slot::Secondary => &mut self.secondary,
            Slot::Extension(i) => &mut self.extensions[i].keys,
        }
    }

    fn insert(&mut self, key: KeyMaterial) -> KeyHandle {
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        let handle = KeyHandle(self.next_handle);
        self.store.insert(handle, key);
        handle
    }
}

pub struct KeyManager {
    security: Arc<SecurityContext>,
    inner: Mutex<Inner>,
}

impl KeyManager {
    pub fn new(security: Arc<SecurityContext>) -> Self {
        KeyManager {
            security,
            inner: Mutex::new(Inner {
                next_handle: 0,
                store: HashMap::new(),
                device: SlotSet::default(),
                network: SlotSet::default(),
                secondary: SlotSet::default(),
                extensions: Vec::with_capacity(EXTENSION_NETWORKS_MAX),
            }),
        }
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// Register an additional network root.
    pub fn extension_network_add(&self, network_id: u32, root: KeyMaterial) -> InfuseResult<()> {
        let network_id = network_id & 0x00FF_FFFF;
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner
            .extensions
            .iter()
            .any(|e| e.network_id == network_id || e.root == root)
        {
            return Err(InfuseError::AlreadyExists);
        }
        if inner.extensions.len() == EXTENSION_NETWORKS_MAX {
            return Err(InfuseError::NoMem);
        }
        inner.extensions.push(ExtensionNetwork {
            network_id,
            root,
            keys: SlotSet::default(),
        });
        info!(network_id = %format!("{network_id:06X}"), "extension network added");
        Ok(())
    }

    /// Retrieve (deriving if required) the key for `(key_type, interface, rotation)`.
    ///
    /// Returns `None` for device keys of other devices and unknown networks.
    pub fn key_get(
        &self,
        key_type: KeyType,
        interface: KeyInterface,
        key_identifier: u32,
        rotation: u32,
    ) -> Option<KeyHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let (slot, base) = match key_type {
            KeyType::Device => {
                if key_identifier != self.security.device_key_identifier() {
                    // Can only decode our own key
                    return None;
                }
                (Slot::Device, self.security.device_root_key().clone())
            }
            KeyType::Network => {
                if key_identifier == self.security.network_key_identifier() {
                    (Slot::Network, self.security.network_root_key().clone())
                } else if let Some(secondary) = self
                    .security
                    .secondary_network()
                    .filter(|s| s.id == key_identifier)
                {
                    (Slot::Secondary, secondary.key.clone())
                } else {
                    let idx = inner
                        .extensions
                        .iter()
                        .position(|e| e.network_id == key_identifier)?;
                    (Slot::Extension(idx), inner.extensions[idx].root.clone())
                }
            }
        };

        let storage = inner.slots(slot)[interface as usize];
        if let (Some(handle), true) = (storage.handle, storage.rotation == rotation) {
            return Some(handle);
        }

        // Delete previous derived key
        if let Some(old) = storage.handle {
            inner.store.remove(&old);
            inner.slots(slot)[interface as usize].handle = None;
        }
        info!(
            interface = interface.info(),
            rotation, "regenerating derived key"
        );
        let start = Instant::now();
        let derived = match derive_chacha_key(&base, &rotation.to_le_bytes(), interface.info().as_bytes()) {
            Ok(k) => k,
            Err(e) => {
                error!(error = %e, "key derivation failed");
                return None;
            }
        };
        debug!(elapsed_us = start.elapsed().as_micros() as u64, "key generated");

        let handle = inner.insert(derived);
        inner.slots(slot)[interface as usize] = KeyStorage {
            rotation,
            handle: Some(handle),
        };
        Some(handle)
    }

    /// Whether `handle` no longer refers to a live key.
    pub fn key_destroyed(&self, handle: KeyHandle) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        !inner.store.contains_key(&handle)
    }

    /// Copy out the raw key bytes.
    pub fn export(&self, handle: KeyHandle) -> InfuseResult<KeyMaterial> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .store
            .get(&handle)
            .cloned()
            .ok_or_else(|| InfuseError::invalid("unknown key handle"))
    }

    pub fn encrypt(
        &self,
        handle: KeyHandle,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> InfuseResult<Vec<u8>> {
        let key = self.export(handle)?;
        Ok(crate::aead::encrypt(&key, nonce, aad, plaintext)?)
    }

    pub fn decrypt(
        &self,
        handle: KeyHandle,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        encrypted: &[u8],
    ) -> InfuseResult<Vec<u8>> {
        let key = self.export(handle)?;
        Ok(crate::aead::decrypt(&key, nonce, aad, encrypted)?)
    }
}
