use serde::{Deserialize, Serialize};

/// Payload type carried in block headers and packet headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InfuseType {
    EchoReq = 0,
    EchoRsp = 1,
    Tdf = 2,
    TdfRemote = 3,
    RpcCmd = 4,
    RpcData = 5,
    RpcDataAck = 6,
    RpcRsp = 7,
    ReceivedEpacket = 8,
    Ack = 9,
    EpacketForward = 10,
    SerialLog = 11,
    MemfaultChunk = 12,
    KeyIds = 127,
}

impl InfuseType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let t = match value {
            0 => InfuseType::EchoReq,
            1 => InfuseType::EchoRsp,
            2 => InfuseType::Tdf,
            3 => InfuseType::TdfRemote,
            4 => InfuseType::RpcCmd,
            5 => InfuseType::RpcData,
            6 => InfuseType::RpcDataAck,
            7 => InfuseType::RpcRsp,
            8 => InfuseType::ReceivedEpacket,
            9 => InfuseType::Ack,
            10 => InfuseType::EpacketForward,
            11 => InfuseType::SerialLog,
            12 => InfuseType::MemfaultChunk,
            127 => InfuseType::KeyIds,
            _ => return None,
        };
        Some(t)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Infuse device identifier (64-bit).
pub type DeviceId = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_roundtrip() {
        for raw in 0..=u8::MAX {
            if let Some(t) = InfuseType::from_u8(raw) {
                assert_eq!(t.as_u8(), raw);
            }
        }
        assert_eq!(InfuseType::from_u8(2), Some(InfuseType::Tdf));
        assert_eq!(InfuseType::from_u8(200), None);
    }
}
