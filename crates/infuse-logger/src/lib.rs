//! infuse-logger: persistent and streaming data logging
//!
//! Every backend stores fixed-size blocks. Persistent backends prefix each
//! block with a two byte header:
//! ```text
//! [wrap: u8][block type: u8][payload ...]
//!
//! wrap   pass number over the physical area, 1..=254 (0x00 / 0xFF = erased)
//! type   InfuseType of the payload
//! ```
//! The wrap counter lets the write position be recovered at startup with a
//! binary search instead of a full scan.
//!
//! [`TdfLogger`] sits on top and packs TDF records into blocks for any set
//! of loggers selected by a [`LoggerMask`].

pub mod backend;
pub mod disk;
pub mod disk_access;
pub mod epacket;
pub mod file_dir;
pub mod flash;
pub mod flash_map;
pub mod logger;
pub mod tdf_logger;

pub use backend::{BackendInfo, LoggerBackend};
pub use disk::{BlockDevice, FileDisk, MemDisk};
pub use disk_access::DiskAccessBackend;
pub use epacket::{epacket_logger, EpacketBackend};
pub use file_dir::FileDirBackend;
pub use flash::{FileFlash, FlashArea, MemFlash};
pub use flash_map::FlashMapBackend;
pub use logger::{BlockHeader, DataLogger, LoggerCallbacks, LoggerState};
pub use tdf_logger::{LoggerMask, TdfBackend, TdfLogger};

/// Bytes of `{wrap, type}` prefix on persisted blocks
pub const BLOCK_HEADER_SIZE: usize = 2;
/// Largest wrap counter value before it re-enters at 1
pub const WRAP_MAX: u8 = 254;
