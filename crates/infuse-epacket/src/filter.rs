//! Gateway forwarding filter

use infuse_core::InfuseType;
use infuse_tdf::definitions::TDF_ANNOUNCE;

use crate::packet::RxPacket;

/// Filter conditions, combined with AND.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterFlags(pub u8);

impl FilterFlags {
    pub const NONE: FilterFlags = FilterFlags(0);
    pub const ONLY_DECRYPTED: FilterFlags = FilterFlags(1 << 0);
    pub const ONLY_TDF: FilterFlags = FilterFlags(1 << 1);
    pub const ONLY_TDF_ANNOUNCE: FilterFlags = FilterFlags(1 << 2);

    pub fn contains(self, other: FilterFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FilterFlags {
    type Output = FilterFlags;

    fn bitor(self, rhs: FilterFlags) -> FilterFlags {
        FilterFlags(self.0 | rhs.0)
    }
}

/// Decide whether a received packet should be forwarded.
///
/// `percent` is a pass probability out of 255: 255 always passes, 0 never.
pub fn forward_filter(flags: FilterFlags, percent: u8, packet: &RxPacket) -> bool {
    let tdf_required = flags.contains(FilterFlags::ONLY_TDF)
        || flags.contains(FilterFlags::ONLY_TDF_ANNOUNCE);
    let decrypt_required = tdf_required || flags.contains(FilterFlags::ONLY_DECRYPTED);

    if decrypt_required && !packet.meta.auth.is_decrypted() {
        return false;
    }
    if tdf_required && packet.meta.packet_type != InfuseType::Tdf.as_u8() {
        return false;
    }
    if flags.contains(FilterFlags::ONLY_TDF_ANNOUNCE)
        && infuse_tdf::find_first(&packet.payload, TDF_ANNOUNCE).is_err()
    {
        return false;
    }
    match percent {
        u8::MAX => true,
        0 => false,
        p => rand::random::<u8>() < p,
    }
}
