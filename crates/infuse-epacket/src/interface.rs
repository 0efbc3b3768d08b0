//! Interface abstraction and observer callbacks

use std::sync::{Arc, PoisonError, RwLock};

use infuse_core::{InfuseError, InfuseResult};
use infuse_crypto::KeyInterface;

pub use crate::packet::InterfaceId;
use crate::packet::{RxPacket, TxMetadata, TxPacket};

type TxFailureFn = dyn Fn(&TxMetadata, &InfuseError) + Send + Sync;
type MaxPayloadFn = dyn Fn(usize) + Send + Sync;
type ReceivedFn = dyn Fn(&RxPacket, bool) + Send + Sync;

/// Observers registered against one interface.
#[derive(Default)]
pub struct InterfaceCallbacks {
    tx_failure: RwLock<Vec<Arc<TxFailureFn>>>,
    max_payload: RwLock<Vec<Arc<MaxPayloadFn>>>,
    received: RwLock<Vec<Arc<ReceivedFn>>>,
}

impl InterfaceCallbacks {
    pub fn on_tx_failure<F>(&self, cb: F)
    where
        F: Fn(&TxMetadata, &InfuseError) + Send + Sync + 'static,
    {
        self.tx_failure
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(cb));
    }

    pub fn on_max_payload_change<F>(&self, cb: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.max_payload
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(cb));
    }

    /// `cb(packet, decrypted)` runs for every received frame.
    pub fn on_packet_received<F>(&self, cb: F)
    where
        F: Fn(&RxPacket, bool) + Send + Sync + 'static,
    {
        self.received
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(cb));
    }

    pub fn clear(&self) {
        self.tx_failure.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.max_payload.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.received.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn notify_max_payload(&self, max_payload: usize) {
        // Clone out so callbacks may register further observers
        let cbs = self.max_payload.read().unwrap_or_else(PoisonError::into_inner).clone();
        for cb in cbs {
            cb(max_payload);
        }
    }

    pub fn notify_received(&self, packet: &RxPacket, decrypted: bool) {
        let cbs = self.received.read().unwrap_or_else(PoisonError::into_inner).clone();
        for cb in cbs {
            cb(packet, decrypted);
        }
    }

    /// Run the per-packet callback, then interface observers on failure.
    pub fn notify_tx_result(&self, packet: &mut TxPacket, result: &InfuseResult<()>) {
        packet.complete(result);
        if let Err(e) = result {
            let cbs = self.tx_failure.read().unwrap_or_else(PoisonError::into_inner).clone();
            for cb in cbs {
                cb(&packet.meta, e);
            }
        }
    }
}

/// A transport that carries ePackets.
pub trait Interface: Send + Sync {
    fn id(&self) -> InterfaceId;

    fn name(&self) -> &str;

    /// Key slot used for this interface's frames, if it encrypts.
    fn key_interface(&self) -> Option<KeyInterface>;

    /// Largest payload that fits one frame; 0 while disconnected.
    fn max_payload(&self) -> usize;

    /// Frame and transmit. Completion is reported through
    /// [`InterfaceCallbacks::notify_tx_result`].
    fn send(&self, packet: TxPacket);

    /// Recover the payload of a raw received frame.
    fn decrypt(&self, raw: Vec<u8>) -> RxPacket;

    fn callbacks(&self) -> &InterfaceCallbacks;

    /// Whether failed decryption should be answered with our key identifiers.
    fn key_ids_on_decrypt_failure(&self) -> bool {
        false
    }
}
