//! Block store over an onboard flash area

use infuse_core::{InfuseError, InfuseResult, InfuseType};

use crate::backend::{BackendInfo, LoggerBackend};
use crate::flash::FlashArea;

/// Flash program granularity
pub const FLASH_WRITE_ALIGN: usize = 4;

/// Splits a flash area into fixed-size blocks. The ring never fills: once
/// the wrap counter exhausts its range it re-enters at 1.
pub struct FlashMapBackend<F: FlashArea> {
    name: String,
    area: F,
    block_size: usize,
}

impl<F: FlashArea> FlashMapBackend<F> {
    pub fn new(name: impl Into<String>, area: F, block_size: usize) -> InfuseResult<Self> {
        let erase_size = area.erase_size() as usize;
        if block_size == 0
            || block_size % FLASH_WRITE_ALIGN != 0
            || erase_size == 0
            || erase_size % block_size != 0
        {
            return Err(InfuseError::invalid(format!(
                "block size {block_size} does not divide erase size {erase_size}"
            )));
        }
        if area.size() < erase_size as u64 || area.size() % erase_size as u64 != 0 {
            return Err(InfuseError::invalid(format!(
                "area size {} is not a multiple of erase size {erase_size}",
                area.size()
            )));
        }
        Ok(FlashMapBackend {
            name: name.into(),
            area,
            block_size,
        })
    }

    pub fn area(&self) -> &F {
        &self.area
    }

    pub fn area_mut(&mut self) -> &mut F {
        &mut self.area
    }

    fn offset(&self, phy_block: u32) -> u64 {
        phy_block as u64 * self.block_size as u64
    }
}

impl<F: FlashArea> LoggerBackend for FlashMapBackend<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            physical_blocks: (self.area.size() / self.block_size as u64) as u32,
            logical_blocks: u32::MAX,
            block_size: self.block_size,
            erase_size: self.area.erase_size(),
            erase_val: self.area.erase_val(),
            write_align: FLASH_WRITE_ALIGN,
            requires_full_block_write: false,
            persistent: true,
        }
    }

    fn write(&mut self, phy_block: u32, _block_type: InfuseType, data: &[u8]) -> InfuseResult<()> {
        let offset = self.offset(phy_block);
        self.area.write(offset, data)
    }

    fn read(&mut self, phy_block: u32, offset: usize, out: &mut [u8]) -> InfuseResult<()> {
        let start = self.offset(phy_block) + offset as u64;
        self.area.read(start, out)
    }

    fn erase(&mut self, phy_block: u32, num: u32) -> InfuseResult<()> {
        let offset = self.offset(phy_block);
        self.area.erase(offset, num as u64 * self.block_size as u64)
    }

    fn flush(&mut self) -> InfuseResult<()> {
        self.area.sync()
    }
}
