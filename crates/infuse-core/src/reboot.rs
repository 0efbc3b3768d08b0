//! Reboot reason retention
//!
//! Before a reboot the reason and timing information is written to a small
//! retained region, guarded by a CRC32 so that a torn or uninitialised region
//! is reported as absent on the next boot.
//!
//! ```text
//! 0  time_source u8
//! 1  epoch_time  u64
//! 9  uptime      u32
//! 13 reason      u8
//! 14 hw_reason   u32
//! 18 thread_name [u8; 8]
//! 26 info_type   u8
//! 27 info        [u8; 32]
//! 59 crc32       u32   (over bytes 0..59)
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{InfuseError, InfuseResult};
use crate::time::{EpochClock, TimeSource};

pub const THREAD_NAME_MAX: usize = 8;
const INFO_SIZE: usize = 32;
const BODY_LEN: usize = 27 + INFO_SIZE;
pub const RECORD_LEN: usize = BODY_LEN + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    /// Kernel or architecture exception code
    Exception(u8),
    HwWatchdog,
    ExternalTrigger,
    Rpc,
    LteModemFault,
    Mcumgr,
    CfgChange,
    SwWatchdog,
    Dfu,
    BtCtlrFault,
    Unknown,
}

impl RebootReason {
    pub fn from_u8(v: u8) -> Self {
        match v {
            128 => RebootReason::HwWatchdog,
            129 => RebootReason::ExternalTrigger,
            130 => RebootReason::Rpc,
            131 => RebootReason::LteModemFault,
            132 => RebootReason::Mcumgr,
            133 => RebootReason::CfgChange,
            134 => RebootReason::SwWatchdog,
            135 => RebootReason::Dfu,
            136 => RebootReason::BtCtlrFault,
            v if v < 128 => RebootReason::Exception(v),
            _ => RebootReason::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RebootReason::Exception(v) => v & 0x7F,
            RebootReason::HwWatchdog => 128,
            RebootReason::ExternalTrigger => 129,
            RebootReason::Rpc => 130,
            RebootReason::LteModemFault => 131,
            RebootReason::Mcumgr => 132,
            RebootReason::CfgChange => 133,
            RebootReason::SwWatchdog => 134,
            RebootReason::Dfu => 135,
            RebootReason::BtCtlrFault => 136,
            RebootReason::Unknown => 255,
        }
    }
}

/// Reason specific payload stored alongside the reboot reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootInfo {
    Generic { info1: u32, info2: u32 },
    ExceptionBasic { program_counter: u32, link_register: u32 },
    /// Basic exception stack frame: r0-r3, r12, lr, pc, xpsr
    ExceptionEsf { frame: [u32; 8] },
    Watchdog { info1: u32, info2: u32 },
}

impl RebootInfo {
    fn type_id(&self) -> u8 {
        match self {
            RebootInfo::Generic { .. } => 0,
            RebootInfo::ExceptionBasic { .. } => 1,
            RebootInfo::ExceptionEsf { .. } => 2,
            RebootInfo::Watchdog { .. } => 3,
        }
    }

    fn encode(&self) -> [u8; INFO_SIZE] {
        let mut out = [0u8; INFO_SIZE];
        let words: Vec<u32> = match *self {
            RebootInfo::Generic { info1, info2 } | RebootInfo::Watchdog { info1, info2 } => {
                vec![info1, info2]
            }
            RebootInfo::ExceptionBasic {
                program_counter,
                link_register,
            } => vec![program_counter, link_register],
            RebootInfo::ExceptionEsf { frame } => frame.to_vec(),
        };
        for (chunk, w) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    fn decode(type_id: u8, raw: &[u8]) -> Option<Self> {
        let mut words = [0u32; 8];
        for (w, chunk) in words.iter_mut().zip(raw.chunks_exact(4)) {
            *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(match type_id {
            0 => RebootInfo::Generic {
                info1: words[0],
                info2: words[1],
            },
            1 => RebootInfo::ExceptionBasic {
                program_counter: words[0],
                link_register: words[1],
            },
            2 => RebootInfo::ExceptionEsf { frame: words },
            3 => RebootInfo::Watchdog {
                info1: words[0],
                info2: words[1],
            },
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootState {
    pub epoch_time_source: TimeSource,
    pub epoch_time: u64,
    pub uptime: u32,
    pub reason: RebootReason,
    pub hardware_reason: u32,
    pub thread_name: String,
    pub info: RebootInfo,
}

impl RebootState {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0] = self.epoch_time_source.raw();
        out[1..9].copy_from_slice(&self.epoch_time.to_le_bytes());
        out[9..13].copy_from_slice(&self.uptime.to_le_bytes());
        out[13] = self.reason.as_u8();
        out[14..18].copy_from_slice(&self.hardware_reason.to_le_bytes());
        let name = self.thread_name.as_bytes();
        let n = name.len().min(THREAD_NAME_MAX);
        out[18..18 + n].copy_from_slice(&name[..n]);
        out[26] = self.info.type_id();
        out[27..BODY_LEN].copy_from_slice(&self.info.encode());
        let crc = crc32fast::hash(&out[..BODY_LEN]);
        out[BODY_LEN..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode a retained record, `None` if the CRC or layout is invalid.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != RECORD_LEN {
            return None;
        }
        let crc = u32::from_le_bytes(raw[BODY_LEN..].try_into().ok()?);
        if crc32fast::hash(&raw[..BODY_LEN]) != crc {
            return None;
        }
        let name_raw = &raw[18..26];
        let name_len = name_raw.iter().position(|b| *b == 0).unwrap_or(THREAD_NAME_MAX);
        Some(RebootState {
            epoch_time_source: TimeSource::from_raw(raw[0]),
            epoch_time: u64::from_le_bytes(raw[1..9].try_into().ok()?),
            uptime: u32::from_le_bytes(raw[9..13].try_into().ok()?),
            reason: RebootReason::from_u8(raw[13]),
            hardware_reason: u32::from_le_bytes(raw[14..18].try_into().ok()?),
            thread_name: String::from_utf8_lossy(&name_raw[..name_len]).into_owned(),
            info: RebootInfo::decode(raw[26], &raw[27..BODY_LEN])?,
        })
    }
}

/// Storage that survives a warm reboot.
pub trait Retention: Send {
    fn read(&mut self) -> InfuseResult<Option<Vec<u8>>>;
    fn write(&mut self, data: &[u8]) -> InfuseResult<()>;
    fn clear(&mut self) -> InfuseResult<()>;
}

#[derive(Debug, Default)]
pub struct MemRetention {
    data: Option<Vec<u8>>,
}

impl MemRetention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw access for fault injection in tests.
    pub fn raw_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.data.as_mut()
    }
}

impl Retention for MemRetention {
    fn read(&mut self) -> InfuseResult<Option<Vec<u8>>> {
        Ok(self.data.clone())
    }

    fn write(&mut self, data: &[u8]) -> InfuseResult<()> {
        self.data = Some(data.to_vec());
        Ok(())
    }

    fn clear(&mut self) -> InfuseResult<()> {
        self.data = None;
        Ok(())
    }
}

/// Retention region backed by a regular file.
#[derive(Debug)]
pub struct FileRetention {
    path: PathBuf,
}

impl FileRetention {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileRetention { path: path.into() }
    }
}

impl Retention for FileRetention {
    fn read(&mut self) -> InfuseResult<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> InfuseResult<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&mut self) -> InfuseResult<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

type RebootHook = Box<dyn Fn(RebootReason) + Send + Sync>;

/// Records reboot reasons and triggers the platform reboot hook.
pub struct RebootManager {
    retention: Mutex<Box<dyn Retention>>,
    clock: Arc<EpochClock>,
    hook: RebootHook,
}

impl RebootManager {
    pub fn new<F>(retention: Box<dyn Retention>, clock: Arc<EpochClock>, hook: F) -> Self
    where
        F: Fn(RebootReason) + Send + Sync + 'static,
    {
        RebootManager {
            retention: Mutex::new(retention),
            clock,
            hook: Box::new(hook),
        }
    }

    fn snapshot(&self, reason: RebootReason, info: RebootInfo) -> RebootState {
        let thread_name = std::thread::current()
            .name()
            .unwrap_or("")
            .chars()
            .take(THREAD_NAME_MAX)
            .collect();
        RebootState {
            epoch_time_source: self.clock.source(),
            epoch_time: self.clock.now(),
            uptime: self.clock.uptime_seconds(),
            reason,
            hardware_reason: 0,
            thread_name,
            info,
        }
    }

    /// Persist the reboot record without rebooting.
    pub fn store(&self, reason: RebootReason, info: RebootInfo) -> InfuseResult<()> {
        let state = self.snapshot(reason, info);
        let mut retention = self.retention.lock().unwrap_or_else(PoisonError::into_inner);
        retention.write(&state.encode())
    }

    /// Persist the reboot record and invoke the reboot hook.
    pub fn reboot(&self, reason: RebootReason, info1: u32, info2: u32) -> InfuseResult<()> {
        self.store(reason, RebootInfo::Generic { info1, info2 })?;
        info!(reason = reason.as_u8(), "rebooting");
        (self.hook)(reason);
        Ok(())
    }

    /// Persist the record now, refresh its time fields after `delay` and reboot.
    pub fn reboot_delayed(
        self: &Arc<Self>,
        reason: RebootReason,
        info1: u32,
        info2: u32,
        delay: Duration,
    ) -> InfuseResult<JoinHandle<()>> {
        self.store(reason, RebootInfo::Generic { info1, info2 })?;
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("reboot".into())
            .spawn(move || {
                std::thread::sleep(delay);
                if let Err(e) = this.refresh_time_fields() {
                    warn!(error = %e, "failed to refresh reboot time");
                }
                info!(reason = reason.as_u8(), "delayed reboot");
                (this.hook)(reason);
            })?;
        Ok(handle)
    }

    fn refresh_time_fields(&self) -> InfuseResult<()> {
        let mut retention = self.retention.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = retention.read()?.ok_or(InfuseError::NotFound)?;
        let mut state = RebootState::decode(&raw).ok_or(InfuseError::NotFound)?;
        state.epoch_time_source = self.clock.source();
        state.epoch_time = self.clock.now();
        state.uptime = self.clock.uptime_seconds();
        retention.write(&state.encode())
    }

    /// Read and clear the record left by the previous boot.
    pub fn query(&self) -> InfuseResult<RebootState> {
        let mut retention = self.retention.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = retention.read()?.ok_or(InfuseError::NotFound)?;
        let state = RebootState::decode(&raw);
        retention.clear()?;
        state.ok_or(InfuseError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    fn manager(hook_seen: Arc<AtomicU8>) -> RebootManager {
        RebootManager::new(
            Box::new(MemRetention::new()),
            Arc::new(EpochClock::new()),
            move |reason| hook_seen.store(reason.as_u8(), Ordering::SeqCst),
        )
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(RebootReason::from_u8(128), RebootReason::HwWatchdog);
        assert_eq!(RebootReason::from_u8(134), RebootReason::SwWatchdog);
        assert_eq!(RebootReason::from_u8(3), RebootReason::Exception(3));
        assert_eq!(RebootReason::from_u8(200), RebootReason::Unknown);
        assert_eq!(RebootReason::BtCtlrFault.as_u8(), 136);
    }

    #[test]
    fn test_record_roundtrip() {
        let state = RebootState {
            epoch_time_source: TimeSource::GNSS,
            epoch_time: 0x1122_3344_5566,
            uptime: 1234,
            reason: RebootReason::Rpc,
            hardware_reason: 7,
            thread_name: "sysworkq".into(),
            info: RebootInfo::ExceptionBasic {
                program_counter: 0x0800_1000,
                link_register: 0x0800_2000,
            },
        };
        let raw = state.encode();
        assert_eq!(RebootState::decode(&raw), Some(state));
    }

    #[test]
    fn test_query_missing() {
        let m = manager(Arc::new(AtomicU8::new(0)));
        assert!(matches!(m.query(), Err(InfuseError::NotFound)));
    }

    #[test]
    fn test_reboot_then_query_clears() {
        let seen = Arc::new(AtomicU8::new(0));
        let m = manager(seen.clone());
        m.reboot(RebootReason::CfgChange, 1, 2).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 133);

        let state = m.query().unwrap();
        assert_eq!(state.reason, RebootReason::CfgChange);
        assert_eq!(state.info, RebootInfo::Generic { info1: 1, info2: 2 });
        assert!(matches!(m.query(), Err(InfuseError::NotFound)));
    }

    #[test]
    fn test_corrupt_record_not_found() {
        let mut retention = MemRetention::new();
        let state = RebootState {
            epoch_time_source: TimeSource::NONE,
            epoch_time: 0,
            uptime: 5,
            reason: RebootReason::Dfu,
            hardware_reason: 0,
            thread_name: String::new(),
            info: RebootInfo::Watchdog { info1: 0, info2: 0 },
        };
        retention.write(&state.encode()).unwrap();
        if let Some(raw) = retention.raw_mut() {
            raw[5] ^= 0x01;
        }
        let m = RebootManager::new(Box::new(retention), Arc::new(EpochClock::new()), |_| {});
        assert!(matches!(m.query(), Err(InfuseError::NotFound)));
    }

    #[test]
    fn test_reboot_delayed_invokes_hook() {
        let seen = Arc::new(AtomicU8::new(0));
        let m = Arc::new(manager(seen.clone()));
        let handle = m
            .reboot_delayed(RebootReason::Mcumgr, 0, 0, Duration::from_millis(20))
            .unwrap();
        handle.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 132);
        assert_eq!(m.query().unwrap().reason, RebootReason::Mcumgr);
    }
}
