//! Block logger that transmits every block as an ePacket

use std::sync::{Arc, Weak};

use infuse_core::{InfuseError, InfuseResult, InfuseType};
use infuse_epacket::processor::InterfaceHandle;
use infuse_epacket::{Auth, Epacket, Interface, TxMetadata, TxPacket};

use crate::backend::{BackendInfo, LoggerBackend};
use crate::logger::DataLogger;

/// Streams blocks out of an interface. Nothing is stored, so reads and
/// erases are unsupported.
pub struct EpacketBackend {
    name: String,
    epacket: Arc<Epacket>,
    handle: InterfaceHandle,
}

impl EpacketBackend {
    pub fn new(epacket: Arc<Epacket>, handle: InterfaceHandle) -> InfuseResult<Self> {
        let name = epacket
            .interface(handle)
            .map(|i| format!("epacket-{}", i.name()))
            .ok_or(InfuseError::NoDevice)?;
        Ok(EpacketBackend {
            name,
            epacket,
            handle,
        })
    }

    fn interface(&self) -> InfuseResult<&Arc<dyn Interface>> {
        self.epacket.interface(self.handle).ok_or(InfuseError::NoDevice)
    }
}

impl LoggerBackend for EpacketBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> BackendInfo {
        let block_size = self.interface().map(|i| i.max_payload()).unwrap_or(0);
        BackendInfo {
            physical_blocks: u32::MAX,
            logical_blocks: u32::MAX,
            block_size,
            erase_size: 0,
            erase_val: 0xFF,
            write_align: 1,
            requires_full_block_write: false,
            persistent: false,
        }
    }

    fn write(&mut self, _phy_block: u32, block_type: InfuseType, data: &[u8]) -> InfuseResult<()> {
        let interface = self.interface()?;
        if data.len() > interface.max_payload() {
            return Err(InfuseError::NoSpace);
        }
        let meta = TxMetadata::new(Auth::Network, 0, block_type);
        self.epacket
            .queue(self.handle, TxPacket::new(meta, data.to_vec()));
        Ok(())
    }

    fn read(&mut self, _phy_block: u32, _offset: usize, _out: &mut [u8]) -> InfuseResult<()> {
        Err(InfuseError::NotSupported)
    }

    fn erase(&mut self, _phy_block: u32, _num: u32) -> InfuseResult<()> {
        Err(InfuseError::NotSupported)
    }

    fn reset(&mut self, _block_hint: u32, _progress: &mut dyn FnMut(u32)) -> InfuseResult<()> {
        Err(InfuseError::NotSupported)
    }
}

/// Create a logger over `handle` that follows the interface's payload
/// size as it connects and disconnects.
pub fn epacket_logger(epacket: Arc<Epacket>, handle: InterfaceHandle) -> InfuseResult<Arc<DataLogger>> {
    let interface = epacket
        .interface(handle)
        .cloned()
        .ok_or(InfuseError::NoDevice)?;
    let backend = EpacketBackend::new(epacket, handle)?;
    let logger = Arc::new(DataLogger::new(Box::new(backend))?);

    let weak: Weak<DataLogger> = Arc::downgrade(&logger);
    interface.callbacks().on_max_payload_change(move |size| {
        if let Some(logger) = weak.upgrade() {
            logger.block_size_changed(size);
        }
    });
    Ok(logger)
}
