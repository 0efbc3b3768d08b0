//! Persisted schedule overrides
//!
//! Overrides replace the built-in schedule at the same index unless that
//! schedule is locked. They live in a JSON object keyed by schedule index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use infuse_core::config::ScheduleConfig;
use infuse_core::{InfuseError, InfuseResult};
use tracing::{debug, info, warn};

use crate::schedule::Schedule;

#[derive(Debug)]
pub struct ScheduleOverrides {
    path: PathBuf,
    entries: BTreeMap<u8, ScheduleConfig>,
    dirty: bool,
}

impl ScheduleOverrides {
    /// Load overrides from `path`. A missing file holds no overrides.
    pub fn load(path: &Path) -> InfuseResult<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                InfuseError::Config(format!("parsing {}: {e}", path.display()))
            })?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), count = entries.len(), "schedule overrides loaded");
        Ok(ScheduleOverrides {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        })
    }

    pub fn get(&self, index: u8) -> Option<&ScheduleConfig> {
        self.entries.get(&index)
    }

    pub fn set(&mut self, index: u8, config: ScheduleConfig) {
        self.entries.insert(index, config);
        self.dirty = true;
    }

    pub fn remove(&mut self, index: u8) -> Option<ScheduleConfig> {
        let removed = self.entries.remove(&index);
        self.dirty |= removed.is_some();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge overrides onto `defaults`. Locked defaults, out of range
    /// indices and overrides that fail to convert are ignored.
    pub fn apply(&self, defaults: &[Schedule]) -> Vec<Schedule> {
        let mut out = defaults.to_vec();
        for (&index, config) in &self.entries {
            let Some(slot) = out.get_mut(index as usize) else {
                warn!(schedule = index, "override for unknown schedule");
                continue;
            };
            if slot.locked {
                debug!(schedule = index, "schedule locked, override ignored");
                continue;
            }
            match Schedule::from_config(config) {
                Ok(schedule) => {
                    info!(schedule = index, task_id = schedule.task_id, "schedule overridden");
                    *slot = schedule;
                }
                Err(e) => warn!(schedule = index, error = %e, "override rejected"),
            }
        }
        out
    }

    /// Write pending changes to disk.
    pub fn save(&mut self) -> InfuseResult<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| InfuseError::Config(format!("serializing overrides: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.dirty = false;
        Ok(())
    }
}
