//! Block store spread across fixed-size container files in a directory
//!
//! Used for removable media mounted with a filesystem. Containers are named
//! `infuse_<device id>_<index>.bin` and created erased on first write, so a
//! card can be read on any host and reset by deleting the files.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use infuse_core::types::DeviceId;
use infuse_core::{InfuseError, InfuseResult, InfuseType};
use tracing::{debug, info};

use crate::backend::{BackendInfo, LoggerBackend};

pub const FILE_DIR_ERASE_VAL: u8 = 0xFF;

pub struct FileDirBackend {
    name: String,
    dir: PathBuf,
    device_id: DeviceId,
    block_size: usize,
    blocks_per_file: u32,
    max_files: u32,
    /// Most recently used container
    cached: Option<(u32, File)>,
}

impl FileDirBackend {
    pub fn new(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        device_id: DeviceId,
        block_size: usize,
        blocks_per_file: u32,
        max_files: u32,
    ) -> InfuseResult<Self> {
        if block_size == 0 || blocks_per_file == 0 || max_files == 0 {
            return Err(InfuseError::invalid("file directory geometry must be non-zero"));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileDirBackend {
            name: name.into(),
            dir,
            device_id,
            block_size,
            blocks_per_file,
            max_files,
            cached: None,
        })
    }

    pub fn container_path(&self, index: u32) -> PathBuf {
        self.dir
            .join(format!("infuse_{:016x}_{index:06}.bin", self.device_id))
    }

    fn file_size(&self) -> u64 {
        self.blocks_per_file as u64 * self.block_size as u64
    }

    fn locate(&self, phy_block: u32) -> (u32, u64) {
        let index = phy_block / self.blocks_per_file;
        let offset = (phy_block % self.blocks_per_file) as u64 * self.block_size as u64;
        (index, offset)
    }

    /// Container `index`, created erased when `create` is set.
    fn container(&mut self, index: u32, create: bool) -> InfuseResult<Option<&mut File>> {
        let hit = matches!(&self.cached, Some((cached, _)) if *cached == index);
        if !hit {
            let path = self.container_path(index);
            let file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound && create => {
                    info!(path = %path.display(), "creating container");
                    let mut f = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create_new(true)
                        .open(&path)?;
                    f.write_all(&vec![FILE_DIR_ERASE_VAL; self.file_size() as usize])?;
                    f
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if file.metadata()?.len() < self.file_size() {
                return Err(InfuseError::invalid(format!(
                    "{} is truncated",
                    path.display()
                )));
            }
            self.cached = Some((index, file));
        }
        Ok(self.cached.as_mut().map(|(_, f)| f))
    }
}

impl LoggerBackend for FileDirBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> BackendInfo {
        let blocks = self.blocks_per_file.saturating_mul(self.max_files);
        BackendInfo {
            physical_blocks: blocks,
            logical_blocks: blocks,
            block_size: self.block_size,
            erase_size: self.block_size as u32,
            erase_val: FILE_DIR_ERASE_VAL,
            write_align: 1,
            requires_full_block_write: true,
            persistent: true,
        }
    }

    fn write(&mut self, phy_block: u32, _block_type: InfuseType, data: &[u8]) -> InfuseResult<()> {
        let (index, offset) = self.locate(phy_block);
        let file = self
            .container(index, true)?
            .ok_or(InfuseError::NoDevice)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, phy_block: u32, offset: usize, out: &mut [u8]) -> InfuseResult<()> {
        let mut block = phy_block + (offset / self.block_size) as u32;
        let mut start = offset % self.block_size;
        let mut done = 0;
        while done < out.len() {
            let (index, file_offset) = self.locate(block);
            // Never touch more than the rest of this container per step
            let remaining_in_file = self.file_size() - file_offset - start as u64;
            let n = (out.len() - done).min(remaining_in_file as usize);
            match self.container(index, false)? {
                Some(file) => {
                    file.seek(SeekFrom::Start(file_offset + start as u64))?;
                    file.read_exact(&mut out[done..done + n])?;
                }
                None => out[done..done + n].fill(FILE_DIR_ERASE_VAL),
            }
            done += n;
            block = (index + 1) * self.blocks_per_file;
            start = 0;
        }
        Ok(())
    }

    fn erase(&mut self, phy_block: u32, num: u32) -> InfuseResult<()> {
        for block in phy_block..phy_block + num {
            let (index, offset) = self.locate(block);
            let size = self.block_size;
            if let Some(file) = self.container(index, false)? {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&vec![FILE_DIR_ERASE_VAL; size])?;
            }
        }
        Ok(())
    }

    /// Deletes every container holding data.
    fn reset(&mut self, block_hint: u32, progress: &mut dyn FnMut(u32)) -> InfuseResult<()> {
        self.cached = None;
        let files = block_hint.div_ceil(self.blocks_per_file).min(self.max_files);
        for index in 0..files {
            let path = self.container_path(index);
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed container"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            progress(((index + 1) * self.blocks_per_file).min(block_hint));
        }
        Ok(())
    }

    fn flush(&mut self) -> InfuseResult<()> {
        if let Some((_, file)) = &self.cached {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// Containers present in `dir`, sorted by index.
pub fn list_containers(dir: &Path) -> InfuseResult<Vec<PathBuf>> {
    let mut found: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("infuse_") && n.ends_with(".bin"))
        })
        .collect();
    found.sort();
    Ok(found)
}
