//! Serial transport: `[0xD5 0xCA][len u16][v0 versioned frame]`

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use infuse_core::time::epoch_time_seconds;
use infuse_core::types::DeviceId;
use infuse_core::{EpochClock, InfuseError, InfuseResult};
use infuse_crypto::{KeyInterface, KeyManager};

use crate::frame::{FrameFormat, V0Codec};
use crate::interface::{Interface, InterfaceCallbacks, InterfaceId};
use crate::packet::{RxPacket, TxPacket};
use crate::PACKET_SIZE_MAX;

pub const SYNC_A: u8 = 0xD5;
pub const SYNC_B: u8 = 0xCA;
const PREFIX_SIZE: usize = 4;

/// Prefix `frame` with the sync bytes and length.
pub fn serial_frame(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_SIZE + frame.len());
    out.extend_from_slice(&[SYNC_A, SYNC_B]);
    out.extend_from_slice(&(frame.len() as u16).to_le_bytes());
    out.extend_from_slice(frame);
    out
}

/// Streaming frame recovery from an arbitrarily chunked byte stream.
#[derive(Debug, Default)]
pub struct SerialReconstructor {
    idx: u8,
    len_lsb: u8,
    remaining: usize,
    /// `None` while discarding an oversized payload
    rx: Option<Vec<u8>>,
}

impl SerialReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    fn prefix_search(&mut self, byte: u8) {
        self.idx = match self.idx {
            0 if byte == SYNC_A => 1,
            1 if byte == SYNC_B => 2,
            // Repeated first sync byte restarts the search in place
            1 if byte == SYNC_A => 1,
            0 | 1 => 0,
            2 => {
                self.len_lsb = byte;
                3
            }
            _ => {
                let len = u16::from_le_bytes([self.len_lsb, byte]) as usize;
                if len == 0 {
                    // Empty payload is invalid
                    0
                } else {
                    self.remaining = len;
                    self.rx = if len > PACKET_SIZE_MAX {
                        warn!(len, "serial payload too large");
                        None
                    } else {
                        Some(Vec::with_capacity(len))
                    };
                    4
                }
            }
        };
    }

    /// Consume `bytes`, calling `on_frame` for each completed payload.
    pub fn feed<F>(&mut self, bytes: &[u8], mut on_frame: F)
    where
        F: FnMut(Vec<u8>),
    {
        let mut i = 0;
        while i < bytes.len() {
            if (self.idx as usize) < PREFIX_SIZE {
                self.prefix_search(bytes[i]);
                i += 1;
                continue;
            }
            let take = self.remaining.min(bytes.len() - i);
            if let Some(rx) = self.rx.as_mut() {
                rx.extend_from_slice(&bytes[i..i + take]);
            }
            i += take;
            self.remaining -= take;
            if self.remaining == 0 {
                self.idx = 0;
                if let Some(frame) = self.rx.take() {
                    on_frame(frame);
                }
            }
        }
    }
}

/// Serial interface writing framed packets to any byte sink.
pub struct SerialInterface<W: Write + Send> {
    writer: Mutex<W>,
    codec: V0Codec,
    clock: Arc<EpochClock>,
    callbacks: InterfaceCallbacks,
}

impl<W: Write + Send> SerialInterface<W> {
    pub fn new(writer: W, keys: Arc<KeyManager>, device_id: DeviceId, clock: Arc<EpochClock>) -> Self {
        SerialInterface {
            writer: Mutex::new(writer),
            codec: V0Codec::new(FrameFormat::Versioned, KeyInterface::Serial, keys, device_id),
            clock,
            callbacks: InterfaceCallbacks::default(),
        }
    }

    /// Run `f` with the underlying writer (test inspection, flushing).
    pub fn with_writer<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut writer)
    }

    fn transmit(&self, packet: &mut TxPacket) -> InfuseResult<()> {
        if packet.payload.len() > self.max_payload() {
            return Err(InfuseError::NoSpace);
        }
        let gps_seconds = epoch_time_seconds(self.clock.now());
        let frame = self.codec.encrypt(&mut packet.meta, gps_seconds, &packet.payload)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&serial_frame(&frame))?;
        writer.flush()?;
        debug!(len = frame.len(), sequence = packet.meta.sequence, "serial frame sent");
        Ok(())
    }
}

impl<W: Write + Send> Interface for SerialInterface<W> {
    fn id(&self) -> InterfaceId {
        InterfaceId::Serial
    }

    fn name(&self) -> &str {
        "serial"
    }

    fn key_interface(&self) -> Option<KeyInterface> {
        Some(KeyInterface::Serial)
    }

    fn max_payload(&self) -> usize {
        PACKET_SIZE_MAX - self.codec.format().overhead()
    }

    fn send(&self, mut packet: TxPacket) {
        let result = self.transmit(&mut packet);
        if let Err(e) = &result {
            warn!(error = %e, "serial send failed");
        }
        self.callbacks.notify_tx_result(&mut packet, &result);
    }

    fn decrypt(&self, raw: Vec<u8>) -> RxPacket {
        self.codec.decrypt(raw)
    }

    fn callbacks(&self) -> &InterfaceCallbacks {
        &self.callbacks
    }
}
