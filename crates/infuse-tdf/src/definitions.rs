//! Well-known TDF identifiers and payload layouts

use serde::Serialize;

pub const TDF_ANNOUNCE: u16 = 1;
pub const TDF_BATTERY_STATE: u16 = 2;
pub const TDF_AMBIENT_TEMP_PRES_HUM: u16 = 3;
pub const TDF_TIME_SYNC: u16 = 5;
pub const TDF_REBOOT_INFO: u16 = 6;
pub const TDF_ACC_4G: u16 = 11;

/// Human readable name of a well-known id.
pub fn name(id: u16) -> Option<&'static str> {
    Some(match id {
        TDF_ANNOUNCE => "ANNOUNCE",
        TDF_BATTERY_STATE => "BATTERY_STATE",
        TDF_AMBIENT_TEMP_PRES_HUM => "AMBIENT_TEMP_PRES_HUM",
        TDF_TIME_SYNC => "TIME_SYNC",
        TDF_REBOOT_INFO => "REBOOT_INFO",
        TDF_ACC_4G => "ACC_4G",
        _ => return None,
    })
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Periodic device announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Announce {
    pub application: u32,
    pub version_major: u8,
    pub version_minor: u8,
    pub version_revision: u16,
    pub version_build: u32,
    pub kv_crc: u32,
    pub uptime: u32,
    pub reboots: u16,
    pub flags: u8,
}

impl Announce {
    pub const SIZE: usize = 24;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.application.to_le_bytes());
        out[4] = self.version_major;
        out[5] = self.version_minor;
        out[6..8].copy_from_slice(&self.version_revision.to_le_bytes());
        out[8..12].copy_from_slice(&self.version_build.to_le_bytes());
        out[12..16].copy_from_slice(&self.kv_crc.to_le_bytes());
        out[16..20].copy_from_slice(&self.uptime.to_le_bytes());
        out[20..22].copy_from_slice(&self.reboots.to_le_bytes());
        out[22] = self.flags;
        out
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Announce {
            application: le_u32(b, 0),
            version_major: b[4],
            version_minor: b[5],
            version_revision: le_u16(b, 6),
            version_build: le_u32(b, 8),
            kv_crc: le_u32(b, 12),
            uptime: le_u32(b, 16),
            reboots: le_u16(b, 20),
            flags: b[22],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatteryState {
    pub voltage_mv: u32,
    pub current_ua: i32,
    pub soc: u8,
}

impl BatteryState {
    pub const SIZE: usize = 9;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.voltage_mv.to_le_bytes());
        out[4..8].copy_from_slice(&self.current_ua.to_le_bytes());
        out[8] = self.soc;
        out
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(BatteryState {
            voltage_mv: le_u32(b, 0),
            current_ua: le_u32(b, 4) as i32,
            soc: b[8],
        })
    }
}

/// Three axis accelerometer sample (raw counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Acc {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Acc {
    pub const SIZE: usize = 6;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.x.to_le_bytes());
        out[2..4].copy_from_slice(&self.y.to_le_bytes());
        out[4..6].copy_from_slice(&self.z.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Acc {
            x: le_u16(b, 0) as i16,
            y: le_u16(b, 2) as i16,
            z: le_u16(b, 4) as i16,
        })
    }
}

/// Decode a well-known payload into JSON for display.
pub fn decode_json(id: u16, data: &[u8]) -> Option<serde_json::Value> {
    let value = match id {
        TDF_ANNOUNCE => serde_json::to_value(Announce::from_bytes(data)?),
        TDF_BATTERY_STATE => serde_json::to_value(BatteryState::from_bytes(data)?),
        TDF_ACC_4G => serde_json::to_value(Acc::from_bytes(data)?),
        _ => return None,
    };
    value.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_layout() {
        let a = Announce {
            application: 0x1234_5678,
            version_major: 1,
            version_minor: 2,
            version_revision: 3,
            version_build: 0xAABBCCDD,
            kv_crc: 7,
            uptime: 100,
            reboots: 4,
            flags: 0x80,
        };
        let raw = a.to_bytes();
        assert_eq!(&raw[0..4], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(Announce::from_bytes(&raw), Some(a));
        assert_eq!(Announce::from_bytes(&raw[..10]), None);
    }

    #[test]
    fn test_decode_json() {
        let acc = Acc { x: -1, y: 2, z: 1000 };
        let v = decode_json(TDF_ACC_4G, &acc.to_bytes()).unwrap();
        assert_eq!(v["x"], -1);
        assert_eq!(v["z"], 1000);
        assert!(decode_json(999, &[0]).is_none());
        assert_eq!(name(TDF_ANNOUNCE), Some("ANNOUNCE"));
    }
}
