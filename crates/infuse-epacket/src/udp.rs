//! UDP transport carrying unversioned v0 frames
//!
//! Sends are non-blocking so the interface can be driven from the
//! synchronous TX path; receiving is async.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use infuse_core::time::epoch_time_seconds;
use infuse_core::types::DeviceId;
use infuse_core::{EpochClock, InfuseError, InfuseResult};
use infuse_crypto::{KeyInterface, KeyManager};

use crate::frame::{FrameFormat, V0Codec};
use crate::interface::{Interface, InterfaceCallbacks, InterfaceId};
use crate::packet::{Address, RxPacket, TxPacket};
use crate::PACKET_SIZE_MAX;

pub struct UdpInterface {
    socket: UdpSocket,
    remote: Mutex<Option<SocketAddr>>,
    codec: V0Codec,
    clock: Arc<EpochClock>,
    callbacks: InterfaceCallbacks,
}

impl UdpInterface {
    pub async fn bind(
        local: SocketAddr,
        keys: Arc<KeyManager>,
        device_id: DeviceId,
        clock: Arc<EpochClock>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(UdpInterface {
            socket,
            remote: Mutex::new(None),
            codec: V0Codec::new(FrameFormat::Unversioned, KeyInterface::Udp, keys, device_id),
            clock,
            callbacks: InterfaceCallbacks::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Set the default peer; the interface is usable from here on.
    pub fn connect(&self, remote: SocketAddr) {
        *self.remote.lock().unwrap_or_else(PoisonError::into_inner) = Some(remote);
        info!(%remote, "udp interface connected");
        self.callbacks.notify_max_payload(self.max_payload());
    }

    pub fn disconnect(&self) {
        *self.remote.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!("udp interface disconnected");
        self.callbacks.notify_max_payload(0);
    }

    /// Wait for one datagram.
    pub async fn recv_frame(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; PACKET_SIZE_MAX];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, from))
    }

    fn transmit(&self, packet: &mut TxPacket) -> InfuseResult<()> {
        let remote = match packet.meta.address {
            Address::Udp(addr) => addr,
            Address::All => self
                .remote
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .ok_or(InfuseError::NotConnected)?,
        };
        if packet.payload.len() > PACKET_SIZE_MAX - self.codec.format().overhead() {
            return Err(InfuseError::NoSpace);
        }
        let gps_seconds = epoch_time_seconds(self.clock.now());
        let frame = self.codec.encrypt(&mut packet.meta, gps_seconds, &packet.payload)?;
        match self.socket.try_send_to(&frame, remote) {
            Ok(_) => {
                debug!(%remote, len = frame.len(), "udp frame sent");
                Ok(())
            }
            // Socket buffer full, the caller may retry
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(InfuseError::Again),
            Err(e) => Err(e.into()),
        }
    }
}

impl Interface for UdpInterface {
    fn id(&self) -> InterfaceId {
        InterfaceId::Udp
    }

    fn name(&self) -> &str {
        "udp"
    }

    fn key_interface(&self) -> Option<KeyInterface> {
        Some(KeyInterface::Udp)
    }

    fn max_payload(&self) -> usize {
        if self.remote.lock().unwrap_or_else(PoisonError::into_inner).is_none() {
            return 0;
        }
        PACKET_SIZE_MAX - self.codec.format().overhead()
    }

    fn send(&self, mut packet: TxPacket) {
        let result = self.transmit(&mut packet);
        if let Err(e) = &result {
            warn!(error = %e, "udp send failed");
        }
        self.callbacks.notify_tx_result(&mut packet, &result);
    }

    fn decrypt(&self, raw: Vec<u8>) -> RxPacket {
        self.codec.decrypt(raw)
    }

    fn callbacks(&self) -> &InterfaceCallbacks {
        &self.callbacks
    }

    // The cloud learns our current keys from the reply
    fn key_ids_on_decrypt_failure(&self) -> bool {
        true
    }
}
