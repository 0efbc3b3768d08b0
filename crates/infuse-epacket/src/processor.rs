//! Packet queueing and receive processing

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tracing::{debug, warn};

use infuse_core::{EpochClock, InfuseError, InfuseType};

use crate::filter::{forward_filter, FilterFlags};
use crate::interface::Interface;
use crate::packet::{Auth, RxPacket, TxMetadata, TxPacket, KEY_ID_REQ_MAGIC};

/// Default depth of the transmit queue.
pub const TX_QUEUE_DEPTH: usize = 16;

/// Index of an interface registered with [`Epacket`].
pub type InterfaceHandle = usize;

type ReceiveHandler = dyn Fn(&Epacket, InterfaceHandle, &RxPacket) + Send + Sync;

/// Common headers prepended to a forwarded packet.
const RECEIVED_COMMON_SIZE: usize = 4;
const RECEIVED_DECRYPTED_SIZE: usize = 20;
const RECEIVED_ENCRYPTED_FLAG: u16 = 0x8000;

/// Wrap a received packet for upload as `RECEIVED_EPACKET`.
///
/// ```text
/// [len|encrypted u16][rssi u8][interface u8]
/// decrypted only: [device_id u64][gps_time u32][type u8][flags u16][sequence u16][key_id u24]
/// [payload]
/// ```
pub fn encode_received(packet: &RxPacket) -> Vec<u8> {
    let meta = &packet.meta;
    let decrypted = meta.auth.is_decrypted();
    let mut len = RECEIVED_COMMON_SIZE + packet.payload.len();
    if decrypted {
        len += RECEIVED_DECRYPTED_SIZE;
    }
    let mut out = Vec::with_capacity(len);
    let flag = if decrypted { 0 } else { RECEIVED_ENCRYPTED_FLAG };
    out.extend_from_slice(&((len as u16 & !RECEIVED_ENCRYPTED_FLAG) | flag).to_le_bytes());
    out.push(meta.rssi.min(0).unsigned_abs().min(u8::MAX as u16) as u8);
    out.push(meta.interface as u8);
    if decrypted {
        out.extend_from_slice(&meta.packet_device_id.to_le_bytes());
        out.extend_from_slice(&meta.packet_gps_time.to_le_bytes());
        out.push(meta.packet_type);
        out.extend_from_slice(&meta.flags.to_le_bytes());
        out.extend_from_slice(&meta.sequence.to_le_bytes());
        out.extend_from_slice(&meta.key_identifier.to_le_bytes()[..3]);
    }
    out.extend_from_slice(&packet.payload);
    out
}

/// The ePacket stack: registered interfaces, a bounded TX queue and the
/// receive pipeline.
pub struct Epacket {
    interfaces: Vec<Arc<dyn Interface>>,
    tx: Sender<(InterfaceHandle, TxPacket)>,
    tx_queue: Mutex<Receiver<(InterfaceHandle, TxPacket)>>,
    clock: Arc<EpochClock>,
    device_key_id: u32,
    prev_key_request: Mutex<Option<u32>>,
    handler: RwLock<Option<Arc<ReceiveHandler>>>,
}

impl Epacket {
    pub fn new(clock: Arc<EpochClock>, device_key_id: u32, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        Epacket {
            interfaces: Vec::new(),
            tx,
            tx_queue: Mutex::new(rx),
            clock,
            device_key_id: device_key_id & 0x00FF_FFFF,
            prev_key_request: Mutex::new(None),
            handler: RwLock::new(None),
        }
    }

    pub fn add_interface(&mut self, interface: Arc<dyn Interface>) -> InterfaceHandle {
        self.interfaces.push(interface);
        self.interfaces.len() - 1
    }

    pub fn interface(&self, handle: InterfaceHandle) -> Option<&Arc<dyn Interface>> {
        self.interfaces.get(handle)
    }

    /// Replace the default receive handler.
    pub fn set_receive_handler<F>(&self, handler: F)
    where
        F: Fn(&Epacket, InterfaceHandle, &RxPacket) + Send + Sync + 'static,
    {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Forward packets received on any other interface to `backhaul` when
    /// they pass the filter.
    pub fn set_gateway_handler(&self, backhaul: InterfaceHandle, flags: FilterFlags, percent: u8) {
        self.set_receive_handler(move |stack, from, packet| {
            if from == backhaul {
                stack.default_receive(from, packet);
                return;
            }
            if !forward_filter(flags, percent, packet) {
                return;
            }
            let encoded = encode_received(packet);
            let meta = TxMetadata::new(Auth::Device, 0, InfuseType::ReceivedEpacket);
            stack.queue(backhaul, TxPacket::new(meta, encoded));
        });
    }

    /// Queue a packet for transmission. A full queue completes the packet
    /// immediately with [`InfuseError::NoMem`].
    pub fn queue(&self, handle: InterfaceHandle, packet: TxPacket) {
        let Some(interface) = self.interfaces.get(handle) else {
            let mut packet = packet;
            packet.complete(&Err(InfuseError::NoDevice));
            return;
        };
        match self.tx.try_send((handle, packet)) {
            Ok(()) => {}
            Err(TrySendError::Full((_, mut packet))) | Err(TrySendError::Closed((_, mut packet))) => {
                warn!(interface = interface.name(), "tx queue full");
                interface
                    .callbacks()
                    .notify_tx_result(&mut packet, &Err(InfuseError::NoMem));
            }
        }
    }

    /// Hand every queued packet to its interface. Returns the number sent.
    pub fn process_tx(&self) -> usize {
        let mut rx = self.tx_queue.lock().unwrap_or_else(PoisonError::into_inner);
        let mut sent = 0;
        while let Ok((handle, packet)) = rx.try_recv() {
            if let Some(interface) = self.interfaces.get(handle) {
                interface.send(packet);
                sent += 1;
            }
        }
        sent
    }

    /// Announce our device key identifier on `handle`.
    pub fn send_key_ids(&self, handle: InterfaceHandle) {
        let meta = TxMetadata::new(Auth::Network, 0, InfuseType::KeyIds);
        let payload = self.device_key_id.to_le_bytes()[..3].to_vec();
        self.queue(handle, TxPacket::new(meta, payload));
    }

    /// Process one raw frame received on `handle`.
    ///
    /// Returns `None` when the frame was consumed as a key identifier request.
    pub fn receive(&self, handle: InterfaceHandle, raw: Vec<u8>, rssi: i16) -> Option<RxPacket> {
        let interface = self.interfaces.get(handle)?;
        debug!(interface = interface.name(), len = raw.len(), rssi, "packet received");

        if raw.len() == 1 && raw[0] == KEY_ID_REQ_MAGIC {
            let uptime = self.clock.uptime_seconds();
            let mut prev = self
                .prev_key_request
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // Bound the replies an unauthenticated peer can trigger
            if *prev == Some(uptime) {
                warn!("too many key id requests");
                return None;
            }
            *prev = Some(uptime);
            drop(prev);
            self.send_key_ids(handle);
            return None;
        }

        let mut packet = interface.decrypt(raw);
        packet.meta.interface = interface.id();
        packet.meta.rssi = rssi;
        let decrypted = packet.meta.auth.is_decrypted();
        if !decrypted && interface.key_ids_on_decrypt_failure() {
            self.send_key_ids(handle);
        }
        interface.callbacks().notify_received(&packet, decrypted);

        let handler = self.handler.read().unwrap_or_else(PoisonError::into_inner).clone();
        match handler {
            Some(handler) => handler(self, handle, &packet),
            None => self.default_receive(handle, &packet),
        }
        Some(packet)
    }

    /// Answer echo requests; everything else is left to the caller.
    pub fn default_receive(&self, handle: InterfaceHandle, packet: &RxPacket) {
        if !packet.meta.auth.is_decrypted() {
            return;
        }
        if packet.packet_type() == Some(InfuseType::EchoReq) {
            let meta = TxMetadata::new(packet.meta.auth, 0, InfuseType::EchoRsp);
            self.queue(handle, TxPacket::new(meta, packet.payload.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyInterface;
    use crate::packet::{InterfaceId, RxMetadata};
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

    fn stack(depth: usize) -> (Epacket, Arc<DummyInterface>, InterfaceHandle) {
        let mut e = Epacket::new(Arc::new(EpochClock::new()), 0x123456, depth);
        let dummy = Arc::new(DummyInterface::new());
        let handle = e.add_interface(dummy.clone());
        (e, dummy, handle)
    }

    #[test]
    fn test_queue_and_process() {
        let (e, dummy, h) = stack(4);
        for i in 0..3 {
            let meta = TxMetadata::new(Auth::Device, 0, InfuseType::Tdf);
            e.queue(h, TxPacket::new(meta, vec![i]));
        }
        assert_eq!(dummy.sent_len(), 0);
        assert_eq!(e.process_tx(), 3);
        assert_eq!(dummy.pop_sent().unwrap()[8..], [0]);
    }

    #[test]
    fn test_queue_full_reports_nomem() {
        let (e, _dummy, h) = stack(1);
        let errno = Arc::new(AtomicI32::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let f = failures.clone();
        e.interface(h).unwrap().callbacks().on_tx_failure(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let meta = TxMetadata::new(Auth::Device, 0, InfuseType::Tdf);
        e.queue(h, TxPacket::new(meta, vec![0]));
        let r = errno.clone();
        e.queue(
            h,
            TxPacket::new(meta, vec![1]).with_tx_done(move |_, res| {
                if let Err(err) = res {
                    r.store(err.errno(), Ordering::SeqCst);
                }
            }),
        );
        assert_eq!(errno.load(Ordering::SeqCst), -12);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_depth_holds_one_packet() {
        let (e, dummy, h) = stack(0);
        let meta = TxMetadata::new(Auth::Device, 0, InfuseType::Tdf);
        e.queue(h, TxPacket::new(meta, vec![5]));
        assert_eq!(e.process_tx(), 1);
        assert_eq!(dummy.pop_sent().unwrap()[8..], [5]);
        assert_eq!(e.process_tx(), 0);
    }

    #[test]
    fn test_unknown_interface() {
        let (e, _, _) = stack(1);
        let errno = Arc::new(AtomicI32::new(0));
        let r = errno.clone();
        let meta = TxMetadata::new(Auth::Device, 0, InfuseType::Tdf);
        e.queue(
            7,
            TxPacket::new(meta, vec![]).with_tx_done(move |_, res| {
                r.store(res.as_ref().map_or_else(|e| e.errno(), |_| 0), Ordering::SeqCst);
            }),
        );
        assert_eq!(errno.load(Ordering::SeqCst), -19);
        assert!(e.receive(7, vec![1, 2], 0).is_none());
    }

    #[test]
    fn test_key_id_request_rate_limited() {
        let (e, dummy, h) = stack(8);
        assert!(e.receive(h, vec![KEY_ID_REQ_MAGIC], 0).is_none());
        assert!(e.receive(h, vec![KEY_ID_REQ_MAGIC], 0).is_none());
        e.process_tx();
        // Second request within the same second is ignored
        assert_eq!(dummy.sent_len(), 1);
        let frame = dummy.pop_sent().unwrap();
        assert_eq!(frame[0], InfuseType::KeyIds.as_u8());
        assert_eq!(frame[1], Auth::Network.as_u8());
        assert_eq!(&frame[8..], &[0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_echo_response() {
        let (e, dummy, h) = stack(8);
        let req = DummyInterface::frame(InfuseType::EchoReq.as_u8(), Auth::Device, 0, 0, b"ping");
        let rx = e.receive(h, req, -40).unwrap();
        assert_eq!(rx.meta.interface, InterfaceId::Dummy);
        assert_eq!(rx.meta.rssi, -40);
        e.process_tx();
        let rsp = dummy.pop_sent().unwrap();
        assert_eq!(rsp[0], InfuseType::EchoRsp.as_u8());
        assert_eq!(&rsp[8..], b"ping");

        // Unauthenticated echo requests are ignored
        let req = DummyInterface::frame(InfuseType::EchoReq.as_u8(), Auth::Failure, 0, 0, b"ping");
        e.receive(h, req, 0);
        e.process_tx();
        assert_eq!(dummy.sent_len(), 0);
    }

    #[test]
    fn test_received_observers() {
        let (e, _dummy, h) = stack(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        e.interface(h).unwrap().callbacks().on_packet_received(move |_, ok| {
            s.fetch_add(if ok { 1 } else { 100 }, Ordering::SeqCst);
        });
        e.receive(h, DummyInterface::frame(2, Auth::Network, 0, 0, &[1]), 0);
        e.receive(h, vec![0; 4], 0);
        assert_eq!(seen.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn test_gateway_forwarding() {
        let mut e = Epacket::new(Arc::new(EpochClock::new()), 1, 8);
        let backhaul = Arc::new(DummyInterface::new());
        let radio = Arc::new(DummyInterface::new());
        let bh = e.add_interface(backhaul.clone());
        let rf = e.add_interface(radio.clone());
        e.set_gateway_handler(bh, FilterFlags::ONLY_DECRYPTED, u8::MAX);

        e.receive(rf, DummyInterface::frame(2, Auth::Network, 0x10, 0xABCDEF, &[7, 7]), -60);
        e.receive(rf, DummyInterface::frame(2, Auth::Failure, 0, 0, &[9]), 0);
        e.process_tx();
        assert_eq!(backhaul.sent_len(), 1);

        let frame = backhaul.pop_sent().unwrap();
        assert_eq!(frame[0], InfuseType::ReceivedEpacket.as_u8());
        let body = &frame[8..];
        assert_eq!(u16::from_le_bytes([body[0], body[1]]), 4 + 20 + 2);
        assert_eq!(body[2], 60);
        assert_eq!(body[3], InterfaceId::Dummy as u8);
        assert_eq!(&body[body.len() - 2..], &[7, 7]);
    }

    #[test]
    fn test_encode_received_encrypted() {
        let packet = RxPacket {
            meta: RxMetadata {
                interface: InterfaceId::Udp,
                ..RxMetadata::default()
            },
            payload: vec![1, 2, 3],
        };
        let raw = encode_received(&packet);
        assert_eq!(raw, vec![0x07, 0x80, 0, 1, 1, 2, 3]);
    }
}
