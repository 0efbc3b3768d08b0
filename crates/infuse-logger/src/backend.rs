//! Storage contract implemented by every block-store backend

use infuse_core::{InfuseResult, InfuseType};

/// Geometry and capabilities a backend reports when it is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    pub physical_blocks: u32,
    /// Blocks addressable before the store reports full
    pub logical_blocks: u32,
    pub block_size: usize,
    /// Erase granularity in bytes, a multiple of `block_size`
    pub erase_size: u32,
    /// Value erased storage reads back as
    pub erase_val: u8,
    /// Writes are padded to a multiple of this many bytes
    pub write_align: usize,
    pub requires_full_block_write: bool,
    /// Whether written blocks can be read back
    pub persistent: bool,
}

impl BackendInfo {
    pub fn erase_blocks(&self) -> u32 {
        if self.block_size == 0 {
            return 1;
        }
        (self.erase_size / self.block_size as u32).max(1)
    }
}

/// A block device the [`crate::DataLogger`] commits blocks to.
///
/// Block indices given to the backend are physical. For persistent
/// backends `data` already carries the `{wrap, type}` header.
pub trait LoggerBackend: Send {
    fn name(&self) -> &str;

    fn info(&self) -> BackendInfo;

    fn write(&mut self, phy_block: u32, block_type: InfuseType, data: &[u8]) -> InfuseResult<()>;

    /// Read `out.len()` bytes starting at `offset` into `phy_block`.
    /// Reads may continue into the following physical blocks.
    fn read(&mut self, phy_block: u32, offset: usize, out: &mut [u8]) -> InfuseResult<()>;

    /// Erase `num` blocks starting at `phy_block`.
    fn erase(&mut self, phy_block: u32, num: u32) -> InfuseResult<()>;

    /// Return the backend to an empty state. `block_hint` bounds how many
    /// leading blocks can contain data; `progress` receives the running
    /// count of blocks erased.
    fn reset(&mut self, block_hint: u32, progress: &mut dyn FnMut(u32)) -> InfuseResult<()> {
        let info = self.info();
        let chunk = info.erase_blocks();
        let mut done = 0;
        while done < block_hint {
            let num = chunk.min(info.physical_blocks - done);
            self.erase(done, num)?;
            done += num;
            progress(done);
        }
        Ok(())
    }

    fn flush(&mut self) -> InfuseResult<()> {
        Ok(())
    }
}
