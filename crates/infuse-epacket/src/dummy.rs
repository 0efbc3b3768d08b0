//! In-memory interface for tests and host tooling
//!
//! Frames are unencrypted: `[type u8][auth u8][flags u16][key_id u32][payload]`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use infuse_core::{InfuseError, InfuseResult};
use infuse_crypto::KeyInterface;

use crate::interface::{Interface, InterfaceCallbacks, InterfaceId};
use crate::packet::{Auth, RxMetadata, RxPacket, TxPacket};
use crate::PACKET_SIZE_MAX;

pub const DUMMY_HEADER_SIZE: usize = 8;

type ErrorFn = Box<dyn Fn() -> InfuseError + Send>;

pub struct DummyInterface {
    sent: Mutex<VecDeque<Vec<u8>>>,
    tx_failure: Mutex<Option<ErrorFn>>,
    max_payload: AtomicUsize,
    callbacks: InterfaceCallbacks,
}

impl Default for DummyInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyInterface {
    pub fn new() -> Self {
        DummyInterface {
            sent: Mutex::new(VecDeque::new()),
            tx_failure: Mutex::new(None),
            max_payload: AtomicUsize::new(PACKET_SIZE_MAX - DUMMY_HEADER_SIZE),
            callbacks: InterfaceCallbacks::default(),
        }
    }

    /// Encode a frame as the interface would put it on the wire.
    pub fn frame(packet_type: u8, auth: Auth, flags: u16, key_identifier: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(DUMMY_HEADER_SIZE + payload.len());
        out.push(packet_type);
        out.push(auth.as_u8());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&key_identifier.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Fail every following send with the error produced by `f`.
    pub fn set_tx_failure<F>(&self, f: F)
    where
        F: Fn() -> InfuseError + Send + 'static,
    {
        *self.tx_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(f));
    }

    pub fn clear_tx_failure(&self) {
        *self.tx_failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn set_max_payload(&self, max_payload: usize) {
        self.max_payload.store(max_payload, Ordering::SeqCst);
        self.callbacks.notify_max_payload(max_payload);
    }

    /// Oldest transmitted frame.
    pub fn pop_sent(&self) -> Option<Vec<u8>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Interface for DummyInterface {
    fn id(&self) -> InterfaceId {
        InterfaceId::Dummy
    }

    fn name(&self) -> &str {
        "dummy"
    }

    fn key_interface(&self) -> Option<KeyInterface> {
        None
    }

    fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::SeqCst)
    }

    fn send(&self, mut packet: TxPacket) {
        let failure = self
            .tx_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|f| f());
        let result: InfuseResult<()> = match failure {
            Some(e) => Err(e),
            None => Ok(()),
        };
        self.callbacks.notify_tx_result(&mut packet, &result);
        if result.is_ok() {
            let meta = &packet.meta;
            let frame = Self::frame(meta.packet_type, meta.auth, meta.flags, 0, &packet.payload);
            self.sent.lock().unwrap_or_else(PoisonError::into_inner).push_back(frame);
        }
    }

    fn decrypt(&self, raw: Vec<u8>) -> RxPacket {
        if raw.len() <= DUMMY_HEADER_SIZE {
            return RxPacket::failed(raw);
        }
        let meta = RxMetadata {
            packet_type: raw[0],
            auth: Auth::from_u8(raw[1]),
            flags: u16::from_le_bytes([raw[2], raw[3]]),
            key_identifier: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ..RxMetadata::default()
        };
        RxPacket {
            meta,
            payload: raw[DUMMY_HEADER_SIZE..].to_vec(),
        }
    }

    fn callbacks(&self) -> &InterfaceCallbacks {
        &self.callbacks
    }
}
