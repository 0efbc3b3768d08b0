//! infuse-tdf: Tagged Data Format
//!
//! A TDF buffer is a stream of self-describing records:
//! ```text
//! [id_flags: u16][len: u8][timestamp: 0|2|6|8][array hdr: 0|4][payload: len * count]
//!
//! id_flags & 0x0FFF  record id (0 and 0xFFF reserved)
//! id_flags & 0xC000  none | absolute | relative (i16) | extended relative (i48)
//! id_flags & 0x3000  single | time array | index array | diff array (reserved)
//! ```
//! Relative timestamps are offsets from the previous timestamped record.

pub mod codec;
pub mod definitions;
pub mod parse;

pub use codec::{TdfBuffer, TdfFormat};
pub use parse::{find_first, TdfDataType, TdfParsed, TdfParser};

pub const TDF_ID_MASK: u16 = 0x0FFF;
/// Highest usable record id.
pub const TDF_ID_MAX: u16 = 0x0FFE;

pub const TDF_TIMESTAMP_MASK: u16 = 0xC000;
pub const TDF_TIMESTAMP_NONE: u16 = 0x0000;
pub const TDF_TIMESTAMP_ABSOLUTE: u16 = 0x4000;
pub const TDF_TIMESTAMP_RELATIVE: u16 = 0x8000;
pub const TDF_TIMESTAMP_EXTENDED_RELATIVE: u16 = 0xC000;

pub const TDF_ARRAY_MASK: u16 = 0x3000;
pub const TDF_ARRAY_NONE: u16 = 0x0000;
pub const TDF_ARRAY_TIME: u16 = 0x1000;
pub const TDF_ARRAY_IDX: u16 = 0x2000;
pub const TDF_ARRAY_DIFF: u16 = 0x3000;

/// `id_flags` plus the length byte.
pub const TDF_HEADER_SIZE: usize = 3;
/// `count:u8` plus a 24-bit period or start index.
pub const TDF_ARRAY_HEADER_SIZE: usize = 4;
pub const TDF_ABSOLUTE_SIZE: usize = 8;
pub const TDF_RELATIVE_SIZE: usize = 2;
pub const TDF_EXTENDED_RELATIVE_SIZE: usize = 6;

/// Largest period or start index an array header can carry.
pub const TDF_ARRAY_FIELD_MAX: u32 = 0x00FF_FFFF;
