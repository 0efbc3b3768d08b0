//! Packet metadata shared by every interface

use std::fmt;
use std::net::SocketAddr;

use infuse_core::{InfuseResult, InfuseType};

/// Packet is protected with the device key (network key when clear).
pub const FLAGS_ENCRYPTION_DEVICE: u16 = 1 << 15;
pub const FLAGS_ENCRYPTION_NETWORK: u16 = 0;
/// Sender requests an acknowledgement.
pub const FLAGS_ACK_REQUEST: u16 = 1 << 14;
/// Sender can forward data to the cloud.
pub const FLAGS_CLOUD_FORWARDING: u16 = 1 << 13;
/// Sender uploads its own data to the cloud.
pub const FLAGS_CLOUD_SELF: u16 = 1 << 12;
pub const FLAGS_INTERFACE_MASK: u16 = 0x00FF;

/// Single byte payload asking the device to announce its key identifiers.
pub const KEY_ID_REQ_MAGIC: u8 = 0x4D;

/// Numeric interface identifiers carried in forwarded packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InterfaceId {
    Serial = 0,
    Udp = 1,
    BtAdv = 2,
    BtPeripheral = 3,
    BtCentral = 4,
    Dummy = 255,
}

/// Authentication applied to (TX) or verified on (RX) a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// RX only: decryption failed or was not attempted.
    Failure,
    /// TX only: payload was already sealed by a downstream device.
    RemoteEncrypted,
    Network,
    Device,
}

impl Auth {
    pub fn as_u8(self) -> u8 {
        match self {
            Auth::Failure | Auth::RemoteEncrypted => 0,
            Auth::Network => 1,
            Auth::Device => 2,
        }
    }

    /// Wire value of an RX auth field.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Auth::Network,
            2 => Auth::Device,
            _ => Auth::Failure,
        }
    }

    pub fn is_decrypted(self) -> bool {
        matches!(self, Auth::Network | Auth::Device)
    }
}

/// Destination of a transmitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Address {
    /// Interface default destination (broadcast / configured peer).
    #[default]
    All,
    Udp(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxMetadata {
    pub auth: Auth,
    pub flags: u16,
    pub packet_type: u8,
    pub address: Address,
    /// Sequence number assigned by the frame encoder.
    pub sequence: u16,
}

impl TxMetadata {
    pub fn new(auth: Auth, flags: u16, packet_type: InfuseType) -> Self {
        TxMetadata {
            auth,
            flags,
            packet_type: packet_type.as_u8(),
            address: Address::All,
            sequence: 0,
        }
    }
}

/// Per-packet completion callback, run once with the send outcome.
pub type TxDone = Box<dyn FnOnce(&TxMetadata, &InfuseResult<()>) + Send>;

pub struct TxPacket {
    pub meta: TxMetadata,
    pub payload: Vec<u8>,
    pub tx_done: Option<TxDone>,
}

impl TxPacket {
    pub fn new(meta: TxMetadata, payload: Vec<u8>) -> Self {
        TxPacket {
            meta,
            payload,
            tx_done: None,
        }
    }

    pub fn with_tx_done<F>(mut self, cb: F) -> Self
    where
        F: FnOnce(&TxMetadata, &InfuseResult<()>) + Send + 'static,
    {
        self.tx_done = Some(Box::new(cb));
        self
    }

    /// Report the send result to the per-packet callback.
    pub fn complete(&mut self, result: &InfuseResult<()>) {
        if let Some(cb) = self.tx_done.take() {
            cb(&self.meta, result);
        }
    }
}

impl fmt::Debug for TxPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxPacket")
            .field("meta", &self.meta)
            .field("len", &self.payload.len())
            .field("tx_done", &self.tx_done.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMetadata {
    pub auth: Auth,
    pub packet_type: u8,
    pub flags: u16,
    pub sequence: u16,
    pub key_identifier: u32,
    pub packet_gps_time: u32,
    pub packet_device_id: u64,
    pub interface: InterfaceId,
    pub rssi: i16,
}

impl Default for RxMetadata {
    fn default() -> Self {
        RxMetadata {
            auth: Auth::Failure,
            packet_type: 0,
            flags: 0,
            sequence: 0,
            key_identifier: 0,
            packet_gps_time: 0,
            packet_device_id: 0,
            interface: InterfaceId::Dummy,
            rssi: 0,
        }
    }
}

/// A received packet. On authentication failure `payload` holds the
/// original frame bytes untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    pub meta: RxMetadata,
    pub payload: Vec<u8>,
}

impl RxPacket {
    pub fn failed(raw: Vec<u8>) -> Self {
        RxPacket {
            meta: RxMetadata::default(),
            payload: raw,
        }
    }

    pub fn packet_type(&self) -> Option<InfuseType> {
        InfuseType::from_u8(self.meta.packet_type)
    }
}
