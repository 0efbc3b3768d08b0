//! Sector addressed block devices (SD cards and disk images)

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use infuse_core::{InfuseError, InfuseResult};

pub const DISK_ERASE_VAL: u8 = 0xFF;

pub trait BlockDevice: Send {
    fn sector_size(&self) -> usize;

    fn sector_count(&self) -> u32;

    /// Sectors in one erase block
    fn erase_sectors(&self) -> u32 {
        1
    }

    /// Read whole sectors starting at `sector`.
    fn read(&mut self, sector: u32, out: &mut [u8]) -> InfuseResult<()>;

    /// Write whole sectors starting at `sector`.
    fn write(&mut self, sector: u32, data: &[u8]) -> InfuseResult<()>;

    fn erase(&mut self, sector: u32, count: u32) -> InfuseResult<()>;

    fn sync(&mut self) -> InfuseResult<()> {
        Ok(())
    }
}

fn check_access(dev: &dyn BlockDevice, sector: u32, len: usize) -> InfuseResult<u32> {
    let size = dev.sector_size();
    if len % size != 0 {
        return Err(InfuseError::invalid(format!(
            "{len} bytes is not a whole number of {size} byte sectors"
        )));
    }
    let count = (len / size) as u32;
    check_sectors(dev, sector, count)?;
    Ok(count)
}

fn check_sectors(dev: &dyn BlockDevice, sector: u32, count: u32) -> InfuseResult<()> {
    if sector as u64 + count as u64 > dev.sector_count() as u64 {
        return Err(InfuseError::invalid(format!(
            "sectors {sector}+{count} beyond disk of {}",
            dev.sector_count()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MemDisk {
    data: Vec<u8>,
    sector_size: usize,
    erase_sectors: u32,
}

impl MemDisk {
    pub fn new(sector_size: usize, sector_count: u32) -> Self {
        MemDisk {
            data: vec![DISK_ERASE_VAL; sector_size * sector_count as usize],
            sector_size,
            erase_sectors: 1,
        }
    }

    /// A disk whose unwritten sectors read back as zero.
    pub fn zeroed(sector_size: usize, sector_count: u32) -> Self {
        MemDisk {
            data: vec![0; sector_size * sector_count as usize],
            sector_size,
            erase_sectors: 1,
        }
    }

    pub fn with_erase_sectors(mut self, erase_sectors: u32) -> Self {
        self.erase_sectors = erase_sectors.max(1);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemDisk {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        (self.data.len() / self.sector_size) as u32
    }

    fn erase_sectors(&self) -> u32 {
        self.erase_sectors
    }

    fn read(&mut self, sector: u32, out: &mut [u8]) -> InfuseResult<()> {
        check_access(&*self, sector, out.len())?;
        let start = sector as usize * self.sector_size;
        out.copy_from_slice(&self.data[start..start + out.len()]);
        Ok(())
    }

    fn write(&mut self, sector: u32, data: &[u8]) -> InfuseResult<()> {
        check_access(&*self, sector, data.len())?;
        let start = sector as usize * self.sector_size;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, sector: u32, count: u32) -> InfuseResult<()> {
        check_sectors(&*self, sector, count)?;
        let start = sector as usize * self.sector_size;
        let end = start + count as usize * self.sector_size;
        self.data[start..end].fill(DISK_ERASE_VAL);
        Ok(())
    }
}

/// Disk image file.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    sector_size: usize,
    sector_count: u32,
}

impl FileDisk {
    /// Open an image, extending it with erased sectors up to `sector_count`.
    pub fn open(path: &Path, sector_size: usize, sector_count: u32) -> InfuseResult<Self> {
        if sector_size == 0 || sector_count == 0 {
            return Err(InfuseError::invalid("disk geometry must be non-zero"));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = sector_size as u64 * sector_count as u64;
        let existing = file.metadata()?.len();
        if existing < size {
            file.seek(SeekFrom::Start(existing))?;
            file.write_all(&vec![DISK_ERASE_VAL; (size - existing) as usize])?;
        }
        Ok(FileDisk {
            file,
            sector_size,
            sector_count,
        })
    }

    fn seek_sector(&mut self, sector: u32) -> InfuseResult<()> {
        self.file
            .seek(SeekFrom::Start(sector as u64 * self.sector_size as u64))?;
        Ok(())
    }
}

impl BlockDevice for FileDisk {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read(&mut self, sector: u32, out: &mut [u8]) -> InfuseResult<()> {
        check_access(&*self, sector, out.len())?;
        self.seek_sector(sector)?;
        self.file.read_exact(out)?;
        Ok(())
    }

    fn write(&mut self, sector: u32, data: &[u8]) -> InfuseResult<()> {
        check_access(&*self, sector, data.len())?;
        self.seek_sector(sector)?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn erase(&mut self, sector: u32, count: u32) -> InfuseResult<()> {
        check_sectors(&*self, sector, count)?;
        self.seek_sector(sector)?;
        self.file
            .write_all(&vec![DISK_ERASE_VAL; count as usize * self.sector_size])?;
        Ok(())
    }

    fn sync(&mut self) -> InfuseResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_disk_sector_access() {
        let mut disk = MemDisk::new(512, 4);
        let sector = vec![0xA5u8; 512];
        disk.write(2, &sector).unwrap();

        let mut out = vec![0u8; 1024];
        disk.read(1, &mut out).unwrap();
        assert!(out[..512].iter().all(|b| *b == DISK_ERASE_VAL));
        assert_eq!(&out[512..], &sector[..]);

        assert!(disk.write(4, &sector).is_err());
        assert!(disk.read(0, &mut [0u8; 100]).is_err());

        disk.erase(2, 1).unwrap();
        disk.read(2, &mut out[..512]).unwrap();
        assert!(out[..512].iter().all(|b| *b == DISK_ERASE_VAL));
    }

    #[test]
    fn test_file_disk_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sd.img");
        {
            let mut disk = FileDisk::open(&path, 512, 8).unwrap();
            disk.write(7, &[0x42; 512]).unwrap();
            disk.sync().unwrap();
        }
        let mut disk = FileDisk::open(&path, 512, 8).unwrap();
        let mut out = [0u8; 512];
        disk.read(7, &mut out).unwrap();
        assert_eq!(out, [0x42; 512]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }
}
