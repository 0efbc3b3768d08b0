//! infuse-core: shared plumbing for the Infuse device platform
//!
//! - `error`: negative-errno style error taxonomy shared by every crate
//! - `config`: TOML configuration schema (`infuse.toml`)
//! - `types`: payload type identifiers carried by blocks and packets
//! - `time`: epoch time base and the local/epoch sync instant
//! - `states`: process-wide application state bitmap with auto-expiry
//! - `reboot`: reboot reason retention guarded by CRC32

pub mod config;
pub mod error;
pub mod reboot;
pub mod states;
pub mod time;
pub mod types;

pub use error::{InfuseError, InfuseResult};
pub use states::{AppState, ApplicationStates, StatesSnapshot};
pub use time::{EpochClock, SyncInstant, TimeSource};
pub use types::InfuseType;
