//! NOR-style flash areas
//!
//! Programming can only clear bits; erasing sets a whole erase unit back
//! to the erase value. Both implementations model that, so a missed
//! erase shows up as corrupted data instead of silently succeeding.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use infuse_core::{InfuseError, InfuseResult};

pub const FLASH_ERASE_VAL: u8 = 0xFF;

pub trait FlashArea: Send {
    fn size(&self) -> u64;

    fn erase_size(&self) -> u32;

    fn erase_val(&self) -> u8 {
        FLASH_ERASE_VAL
    }

    fn read(&mut self, offset: u64, out: &mut [u8]) -> InfuseResult<()>;

    fn write(&mut self, offset: u64, data: &[u8]) -> InfuseResult<()>;

    /// `offset` and `len` must be aligned to the erase size.
    fn erase(&mut self, offset: u64, len: u64) -> InfuseResult<()>;

    fn sync(&mut self) -> InfuseResult<()> {
        Ok(())
    }
}

fn check_range(size: u64, offset: u64, len: u64) -> InfuseResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(InfuseError::invalid(format!(
            "flash access {offset}+{len} outside area of {size} bytes"
        ))),
    }
}

fn check_erase(erase_size: u32, offset: u64, len: u64) -> InfuseResult<()> {
    let unit = erase_size as u64;
    if offset % unit != 0 || len % unit != 0 {
        return Err(InfuseError::invalid(format!(
            "erase {offset}+{len} not aligned to {unit}"
        )));
    }
    Ok(())
}

/// Flash area held in memory.
#[derive(Debug, Clone)]
pub struct MemFlash {
    data: Vec<u8>,
    erase_size: u32,
}

impl MemFlash {
    /// A fully erased area.
    pub fn new(size: usize, erase_size: u32) -> Self {
        MemFlash {
            data: vec![FLASH_ERASE_VAL; size],
            erase_size,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Direct access for corrupting contents in tests.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl FlashArea for MemFlash {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn erase_size(&self) -> u32 {
        self.erase_size
    }

    fn read(&mut self, offset: u64, out: &mut [u8]) -> InfuseResult<()> {
        check_range(self.size(), offset, out.len() as u64)?;
        let start = offset as usize;
        out.copy_from_slice(&self.data[start..start + out.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> InfuseResult<()> {
        check_range(self.size(), offset, data.len() as u64)?;
        let start = offset as usize;
        for (dst, src) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u64) -> InfuseResult<()> {
        check_range(self.size(), offset, len)?;
        check_erase(self.erase_size, offset, len)?;
        let start = offset as usize;
        self.data[start..start + len as usize].fill(FLASH_ERASE_VAL);
        Ok(())
    }
}

/// Flash area persisted in an image file.
#[derive(Debug)]
pub struct FileFlash {
    file: File,
    size: u64,
    erase_size: u32,
}

impl FileFlash {
    /// Open an existing image, or create an erased one of `size` bytes.
    pub fn open(path: &Path, size: u64, erase_size: u32) -> InfuseResult<Self> {
        if erase_size == 0 || size % erase_size as u64 != 0 {
            return Err(InfuseError::invalid(format!(
                "area of {size} bytes is not a multiple of erase size {erase_size}"
            )));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let existing = file.metadata()?.len();
        if existing < size {
            file.seek(SeekFrom::Start(existing))?;
            let fill = vec![FLASH_ERASE_VAL; (size - existing) as usize];
            file.write_all(&fill)?;
            file.flush()?;
        } else if existing > size {
            return Err(InfuseError::invalid(format!(
                "{} holds {existing} bytes, larger than the {size} byte area",
                path.display()
            )));
        }
        Ok(FileFlash {
            file,
            size,
            erase_size,
        })
    }
}

impl FlashArea for FileFlash {
    fn size(&self) -> u64 {
        self.size
    }

    fn erase_size(&self) -> u32 {
        self.erase_size
    }

    fn read(&mut self, offset: u64, out: &mut [u8]) -> InfuseResult<()> {
        check_range(self.size, offset, out.len() as u64)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(out)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> InfuseResult<()> {
        let mut merged = vec![0u8; data.len()];
        self.read(offset, &mut merged)?;
        for (dst, src) in merged.iter_mut().zip(data) {
            *dst &= *src;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&merged)?;
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u64) -> InfuseResult<()> {
        check_range(self.size, offset, len)?;
        check_erase(self.erase_size, offset, len)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&vec![FLASH_ERASE_VAL; len as usize])?;
        Ok(())
    }

    fn sync(&mut self) -> InfuseResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
