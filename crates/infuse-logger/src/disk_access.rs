//! Block store directly over the sectors of removable media

use infuse_core::{InfuseError, InfuseResult, InfuseType};
use tracing::debug;

use crate::backend::{BackendInfo, LoggerBackend};
use crate::disk::{BlockDevice, DISK_ERASE_VAL};
use crate::WRAP_MAX;

/// One block per sector. The store is full after the wrap counter has
/// been used once for every pass.
pub struct DiskAccessBackend<D: BlockDevice> {
    name: String,
    disk: D,
    erase_chunk: u32,
    scratch: Vec<u8>,
}

impl<D: BlockDevice> DiskAccessBackend<D> {
    /// `erase_chunk` is the number of sectors discarded per step of a reset.
    pub fn new(name: impl Into<String>, disk: D, erase_chunk: u32) -> InfuseResult<Self> {
        if disk.sector_size() == 0 || disk.sector_count() == 0 {
            return Err(InfuseError::NoDevice);
        }
        let scratch = vec![0; disk.sector_size()];
        Ok(DiskAccessBackend {
            name: name.into(),
            disk,
            erase_chunk: erase_chunk.max(1),
            scratch,
        })
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }
}

impl<D: BlockDevice> LoggerBackend for DiskAccessBackend<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> BackendInfo {
        let sector_size = self.disk.sector_size();
        BackendInfo {
            physical_blocks: self.disk.sector_count(),
            logical_blocks: self.disk.sector_count().saturating_mul(WRAP_MAX as u32),
            block_size: sector_size,
            erase_size: self.disk.erase_sectors() * sector_size as u32,
            erase_val: DISK_ERASE_VAL,
            write_align: 1,
            requires_full_block_write: true,
            persistent: true,
        }
    }

    fn write(&mut self, phy_block: u32, _block_type: InfuseType, data: &[u8]) -> InfuseResult<()> {
        if data.len() != self.disk.sector_size() {
            return Err(InfuseError::invalid(format!(
                "partial sector write of {} bytes",
                data.len()
            )));
        }
        debug!(name = %self.name, block = phy_block, "writing sector");
        self.disk.write(phy_block, data)
    }

    fn read(&mut self, phy_block: u32, offset: usize, out: &mut [u8]) -> InfuseResult<()> {
        let size = self.disk.sector_size();
        if offset == 0 && out.len() % size == 0 {
            return self.disk.read(phy_block, out);
        }
        let mut sector = phy_block + (offset / size) as u32;
        let mut start = offset % size;
        let mut done = 0;
        while done < out.len() {
            self.disk.read(sector, &mut self.scratch)?;
            let n = (size - start).min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.scratch[start..start + n]);
            done += n;
            start = 0;
            sector += 1;
        }
        Ok(())
    }

    fn erase(&mut self, phy_block: u32, num: u32) -> InfuseResult<()> {
        self.disk.erase(phy_block, num)
    }

    fn reset(&mut self, block_hint: u32, progress: &mut dyn FnMut(u32)) -> InfuseResult<()> {
        let to_erase = block_hint.min(self.disk.sector_count());
        let mut sector = 0;
        while sector < to_erase {
            let num = self.erase_chunk.min(self.disk.sector_count() - sector);
            self.disk.erase(sector, num)?;
            sector += num;
            progress(sector);
        }
        Ok(())
    }

    fn flush(&mut self) -> InfuseResult<()> {
        self.disk.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    #[test]
    fn test_geometry() {
        let backend = DiskAccessBackend::new("sd", MemDisk::new(512, 100), 16).unwrap();
        let info = backend.info();
        assert_eq!(info.physical_blocks, 100);
        assert_eq!(info.logical_blocks, 25_400);
        assert!(info.requires_full_block_write);
        assert_eq!(info.erase_blocks(), 1);
    }

    #[test]
    fn test_partial_writes_rejected() {
        let mut backend = DiskAccessBackend::new("sd", MemDisk::new(512, 4), 1).unwrap();
        assert!(matches!(
            backend.write(0, InfuseType::Tdf, &[0; 100]),
            Err(InfuseError::Invalid(_))
        ));
    }

    #[test]
    fn test_unaligned_reads() {
        let mut backend = DiskAccessBackend::new("sd", MemDisk::new(64, 4), 1).unwrap();
        backend.write(1, InfuseType::Tdf, &[1; 64]).unwrap();
        backend.write(2, InfuseType::Tdf, &[2; 64]).unwrap();

        let mut out = [0u8; 8];
        backend.read(1, 60, &mut out).unwrap();
        assert_eq!(out, [1, 1, 1, 1, 2, 2, 2, 2]);

        let mut whole = [0u8; 128];
        backend.read(1, 0, &mut whole).unwrap();
        assert_eq!(whole[63], 1);
        assert_eq!(whole[64], 2);
    }

    #[test]
    fn test_reset_progress() {
        let mut backend = DiskAccessBackend::new("sd", MemDisk::new(64, 10), 4).unwrap();
        let mut seen = Vec::new();
        backend.reset(10, &mut |n| seen.push(n)).unwrap();
        assert_eq!(seen, vec![4, 8, 10]);

        seen.clear();
        backend.reset(3, &mut |n| seen.push(n)).unwrap();
        assert_eq!(seen, vec![4]);
    }
}
