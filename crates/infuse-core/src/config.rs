use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{InfuseError, InfuseResult};

/// Top-level device configuration (loaded from infuse.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfuseConfig {
    pub device: DeviceConfig,
    pub logger: LoggerConfig,
    pub tdf: TdfConfig,
    pub task_runner: TaskRunnerConfig,
    pub schedules: Vec<ScheduleConfig>,
    pub log: LogConfig,
}

impl InfuseConfig {
    /// Read and parse a TOML configuration file.
    pub fn load(path: &Path) -> InfuseResult<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| InfuseError::Config(format!("{}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// 64-bit device identifier
    pub device_id: u64,
    /// 24-bit identifier of the primary network key
    pub network_id: u32,
    /// Primary network root key (base64, 32 bytes)
    pub network_key: Option<String>,
    /// Optional secondary network as `(id, base64 key)`
    pub secondary_network_id: Option<u32>,
    pub secondary_network_key: Option<String>,
    /// Cloud X25519 public key (base64, 32 bytes)
    pub cloud_public_key: Option<String>,
    /// File holding the device X25519 secret (raw 32 bytes)
    pub device_secret_file: Option<PathBuf>,
    /// Reboot retention file
    pub retention_file: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            network_id: 0,
            network_key: None,
            secondary_network_id: None,
            secondary_network_key: None,
            cloud_public_key: None,
            device_secret_file: None,
            retention_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub flash: FlashLoggerConfig,
    pub removable: RemovableLoggerConfig,
}

/// Onboard flash area used by the flash-map block store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashLoggerConfig {
    pub enabled: bool,
    /// Backing image file (in-memory when unset)
    pub image: Option<PathBuf>,
    pub block_size: u32,
    pub erase_size: u32,
    pub area_size: u64,
}

impl Default for FlashLoggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: None,
            block_size: 512,
            erase_size: 4096,
            area_size: 1024 * 1024,
        }
    }
}

/// Removable media used by the disk-access block store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemovableLoggerConfig {
    pub enabled: bool,
    pub image: Option<PathBuf>,
    pub sector_size: u32,
    pub sector_count: u32,
    /// Sectors erased per chunk during a full erase
    pub erase_sectors: u32,
}

impl Default for RemovableLoggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: None,
            sector_size: 512,
            sector_count: 8192,
            erase_sectors: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TdfConfig {
    /// Upper bound on any backend's TDF buffer
    pub buffer_max_size: usize,
    /// Flush the backend when fewer bytes than this remain
    pub auto_flush_tailroom: usize,
}

impl Default for TdfConfig {
    fn default() -> Self {
        Self {
            buffer_max_size: 512,
            auto_flush_tailroom: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRunnerConfig {
    /// JSON file holding persisted schedule overrides
    pub schedule_overrides: Option<PathBuf>,
    /// Software watchdog timeout in seconds (0 disables)
    pub watchdog_timeout_s: u32,
    /// Period between runner iterations in milliseconds
    pub iteration_period_ms: u64,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            schedule_overrides: None,
            watchdog_timeout_s: 10,
            iteration_period_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleValidity {
    #[default]
    Always,
    Active,
    Inactive,
    PermanentlyRuns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeriodicityConfig {
    /// No periodicity constraint
    None,
    Fixed {
        period_s: u32,
    },
    Lockout {
        lockout_s: u32,
        #[serde(default)]
        ignore_first: bool,
    },
    After {
        /// Schedule index whose termination starts this one
        linked: u8,
        duration_s: u32,
    },
    LockoutDynamicBattery {
        lockout_min_s: u32,
        lockout_max_s: u32,
        /// Charge at or below which `lockout_max_s` applies
        #[serde(default)]
        battery_min: u8,
        /// Charge at or above which `lockout_min_s` applies
        #[serde(default = "default_battery_max")]
        battery_max: u8,
    },
}

fn default_battery_max() -> u8 {
    100
}

impl Default for PeriodicityConfig {
    fn default() -> Self {
        PeriodicityConfig::Lockout {
            lockout_s: 60,
            ignore_first: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryRange {
    pub lower: u8,
    pub upper: u8,
}

/// One slot of a state predicate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTerm {
    pub state: u8,
    /// Invert this state
    pub not: bool,
    /// Combine with the running result using OR instead of AND
    pub or: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLoggingConfig {
    pub loggers: u8,
    pub tdf_mask: u32,
}

/// Declarative schedule entry (`[[schedules]]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub task_id: u8,
    pub validity: ScheduleValidity,
    /// Ignore persisted overrides for this schedule
    pub locked: bool,
    pub boot_lockout_minutes: u8,
    pub timeout_s: u32,
    pub battery_start: BatteryRange,
    pub battery_terminate: BatteryRange,
    pub periodicity: PeriodicityConfig,
    pub states_start_timeout_2x_s: u16,
    pub states_start: Vec<StateTerm>,
    pub states_terminate: Vec<StateTerm>,
    pub task_logging: Vec<TaskLoggingConfig>,
    /// Task specific arguments, at most 16 bytes
    pub task_args: Vec<u8>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            task_id: 0,
            validity: ScheduleValidity::Always,
            locked: false,
            boot_lockout_minutes: 0,
            timeout_s: 0,
            battery_start: BatteryRange::default(),
            battery_terminate: BatteryRange::default(),
            periodicity: PeriodicityConfig::default(),
            states_start_timeout_2x_s: 0,
            states_start: Vec::new(),
            states_terminate: Vec::new(),
            task_logging: Vec::new(),
            task_args: Vec::new(),
        }
    }
}
