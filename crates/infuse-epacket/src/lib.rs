//! infuse-epacket: authenticated packet transport
//!
//! ```text
//! TX: TxPacket -> Epacket::queue -> bounded queue -> Interface::send
//!                                                     (v0 frame encrypt)
//! RX: raw bytes -> Epacket::receive -> key-id request? -> Interface::decrypt
//!                                   -> observers -> receive handler
//! ```
//!
//! Frames are ChaCha20-Poly1305 sealed with keys from
//! [`infuse_crypto::KeyManager`], rotating once per GPS day.

pub mod dummy;
pub mod filter;
pub mod frame;
pub mod interface;
pub mod packet;
pub mod processor;
pub mod serial;
pub mod udp;

pub use dummy::DummyInterface;
pub use filter::{forward_filter, FilterFlags};
pub use frame::{FrameFormat, V0Codec};
pub use interface::{Interface, InterfaceCallbacks, InterfaceId};
pub use packet::{Address, Auth, RxMetadata, RxPacket, TxMetadata, TxPacket};
pub use processor::Epacket;
pub use serial::{SerialInterface, SerialReconstructor};
pub use udp::UdpInterface;

/// Largest frame any interface will emit or accept.
pub const PACKET_SIZE_MAX: usize = 512;
