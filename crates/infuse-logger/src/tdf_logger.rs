//! Fan-out TDF logging
//!
//! Each backend bit in a [`LoggerMask`] owns a TDF buffer sized to one
//! block of its [`DataLogger`]. Records accumulate until the buffer fills
//! (or is explicitly flushed) and are then committed as a single block.

use std::ops::BitOr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

use infuse_core::config::TdfConfig;
use infuse_core::{InfuseError, InfuseResult, InfuseType};
use infuse_tdf::{TdfBuffer, TdfDataType, TdfFormat, TdfParser};

use crate::logger::{DataLogger, LoggerCallbacks};

/// Backend selection bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoggerMask(u8);

impl LoggerMask {
    pub const NONE: LoggerMask = LoggerMask(0);
    pub const FLASH: LoggerMask = LoggerMask(1 << 0);
    pub const REMOVABLE: LoggerMask = LoggerMask(1 << 1);
    pub const SERIAL: LoggerMask = LoggerMask(1 << 2);
    pub const UDP: LoggerMask = LoggerMask(1 << 3);
    pub const BT_ADV: LoggerMask = LoggerMask(1 << 4);
    pub const BT_PERIPHERAL: LoggerMask = LoggerMask(1 << 5);

    pub const fn from_bits(bits: u8) -> Self {
        LoggerMask(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: LoggerMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for LoggerMask {
    type Output = LoggerMask;

    fn bitor(self, rhs: LoggerMask) -> LoggerMask {
        LoggerMask(self.0 | rhs.0)
    }
}

/// Size of the remote id prefix on `TDF_REMOTE` blocks.
pub const REMOTE_ID_SIZE: usize = 8;

struct Pending {
    tdf: TdfBuffer,
    /// Total block bytes available, including overhead and remote prefix
    size: usize,
    remote_id: u64,
    /// Records lost while repacking into smaller blocks
    dropped: u32,
}

/// One backend of the fan-out logger.
pub struct TdfBackend {
    mask: LoggerMask,
    logger: Arc<DataLogger>,
    block_type: InfuseType,
    overhead: usize,
    max_size: usize,
    auto_flush_tailroom: usize,
    pending: Mutex<Pending>,
}

impl TdfBackend {
    fn new(
        mask: LoggerMask,
        logger: Arc<DataLogger>,
        block_type: InfuseType,
        config: &TdfConfig,
    ) -> Arc<Self> {
        let state = logger.state();
        // Disconnected loggers buffer up to the maximum until the link returns
        let size = match state.block_size {
            0 => config.buffer_max_size,
            block_size => block_size.min(config.buffer_max_size),
        };
        let backend = Arc::new(TdfBackend {
            mask,
            logger: logger.clone(),
            block_type,
            overhead: state.block_overhead,
            max_size: config.buffer_max_size,
            auto_flush_tailroom: config.auto_flush_tailroom,
            pending: Mutex::new(Pending {
                tdf: TdfBuffer::new(0),
                size,
                remote_id: 0,
                dropped: 0,
            }),
        });
        {
            let mut pending = backend.lock();
            let capacity = backend.capacity(size);
            pending.tdf.set_capacity(capacity);
        }

        let weak: Weak<TdfBackend> = Arc::downgrade(&backend);
        logger.register_cb(LoggerCallbacks::new().on_block_size_update(move |size| {
            if let Some(backend) = weak.upgrade() {
                backend.block_size_update(size);
            }
        }));
        backend
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prefix_len(&self) -> usize {
        if self.block_type == InfuseType::TdfRemote {
            REMOTE_ID_SIZE
        } else {
            0
        }
    }

    /// TDF bytes that fit in a block of `size` bytes.
    fn capacity(&self, size: usize) -> usize {
        size.saturating_sub(self.overhead + self.prefix_len())
    }

    pub fn mask(&self) -> LoggerMask {
        self.mask
    }

    pub fn logger(&self) -> &Arc<DataLogger> {
        &self.logger
    }

    /// Bytes waiting to be committed.
    pub fn block_bytes_pending(&self) -> usize {
        let pending = self.lock();
        if pending.tdf.is_empty() {
            0
        } else {
            self.prefix_len() + pending.tdf.len()
        }
    }

    /// Bytes still free in the pending block.
    pub fn block_bytes_remaining(&self) -> usize {
        self.lock().tdf.tailroom()
    }

    /// Records discarded because they no longer fit after a block size
    /// reduction.
    pub fn records_dropped(&self) -> u32 {
        self.lock().dropped
    }

    /// Add records to the pending block, committing blocks as they fill.
    ///
    /// A TDF header holds at most 255 samples, larger counts are written as
    /// consecutive arrays continuing the time or index of the previous one.
    #[allow(clippy::too_many_arguments)]
    pub fn log_core(
        &self,
        id: u16,
        len: u8,
        count: u16,
        format: TdfFormat,
        time: u64,
        idx_period: u32,
        data: &[u8],
    ) -> InfuseResult<()> {
        if count == 0 || data.len() < len as usize * count as usize {
            return Err(InfuseError::invalid(format!(
                "TDF {id}: {} bytes for {count} samples of {len}",
                data.len()
            )));
        }
        let mut pending = self.lock();
        if pending.size == 0 {
            debug!(mask = self.mask.bits(), "backend disconnected");
            return Err(InfuseError::NotConnected);
        }

        let mut remaining = count;
        let mut time = time;
        let mut field = idx_period;
        let mut data = data;
        while remaining > 0 {
            let chunk = remaining.min(u8::MAX as u16) as u8;
            self.log_locked(&mut pending, id, len, chunk, format, time, field, data)?;
            data = &data[chunk as usize * len as usize..];
            remaining -= chunk as u16;
            if format == TdfFormat::IdxArray {
                field += chunk as u32;
                time = 0;
            } else if time != 0 {
                time += field as u64 * chunk as u64;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn log_locked(
        &self,
        pending: &mut Pending,
        id: u16,
        len: u8,
        count: u8,
        format: TdfFormat,
        time: u64,
        idx_period: u32,
        data: &[u8],
    ) -> InfuseResult<()> {
        let mut count = count;
        let mut time = time;
        let mut idx_period = idx_period;
        let mut data = data;
        let mut retried = false;
        loop {
            match pending
                .tdf
                .add_core(id, len, count, time, format, idx_period, data)
            {
                Ok(added) if added == count => break,
                Ok(added) => {
                    debug!(mask = self.mask.bits(), added, count, "partial add");
                    data = &data[added as usize * len as usize..];
                    if format == TdfFormat::IdxArray {
                        // Continues with the next index and no time
                        idx_period += added as u32;
                        time = 0;
                    } else if time != 0 {
                        time += idx_period as u64 * added as u64;
                    }
                    count -= added;
                    retried = false;
                }
                Err(InfuseError::NoMem) if !retried => {
                    debug!(mask = self.mask.bits(), "no space, flush and retry");
                    self.flush_locked(pending)?;
                    retried = true;
                }
                Err(e) => {
                    warn!(mask = self.mask.bits(), id, error = %e, "failed to add TDF");
                    return Err(e);
                }
            }
        }

        if pending.tdf.tailroom() < self.auto_flush_tailroom {
            debug!(mask = self.mask.bits(), "auto flush");
            self.flush_locked(pending)?;
        }
        Ok(())
    }

    /// Commit the pending block, if any.
    pub fn flush(&self) -> InfuseResult<()> {
        let mut pending = self.lock();
        self.flush_locked(&mut pending)
    }

    fn flush_locked(&self, pending: &mut Pending) -> InfuseResult<()> {
        if pending.tdf.is_empty() {
            return Ok(());
        }
        let mut block = Vec::with_capacity(self.prefix_len() + pending.tdf.len());
        if self.block_type == InfuseType::TdfRemote {
            block.extend_from_slice(&pending.remote_id.to_le_bytes());
        }
        block.extend_from_slice(pending.tdf.as_bytes());

        let result = self.logger.write(self.block_type, &block);
        match &result {
            // Keep the data for a later attempt
            Err(e) if e.is_transient() => return result,
            Err(e) => warn!(mask = self.mask.bits(), error = %e, "dropping TDF block"),
            Ok(()) => {}
        }
        pending.tdf.reset();
        result
    }

    /// Change the remote device the following records belong to.
    pub fn remote_id_set(&self, remote_id: u64) -> InfuseResult<()> {
        if self.block_type != InfuseType::TdfRemote {
            return Err(InfuseError::invalid("backend does not carry remote TDFs"));
        }
        let mut pending = self.lock();
        if pending.remote_id == remote_id {
            return Ok(());
        }
        // Pending records belong to the previous id
        let result = self.flush_locked(&mut pending);
        pending.remote_id = remote_id;
        result
    }

    pub fn remote_id(&self) -> u64 {
        self.lock().remote_id
    }

    fn block_size_update(&self, block_size: usize) {
        let mut pending = self.lock();
        let limited = block_size.min(self.max_size);
        debug!(mask = self.mask.bits(), from = pending.size, to = limited, "block size update");
        if block_size == 0 {
            // Disconnected: buffer as much as allowed until the link returns
            pending.size = self.max_size;
            let capacity = self.capacity(self.max_size);
            pending.tdf.set_capacity(capacity);
        } else if pending.tdf.len() <= self.capacity(limited) {
            pending.size = limited;
            let capacity = self.capacity(limited);
            pending.tdf.set_capacity(capacity);
        } else {
            // Replay what is pending into buffers of the new size
            let replay = pending.tdf.as_bytes().to_vec();
            pending.size = limited;
            pending.tdf.reset();
            let capacity = self.capacity(limited);
            pending.tdf.set_capacity(capacity);
            let mut parser = TdfParser::new(&replay);
            loop {
                let parsed = match parser.parse() {
                    Ok(parsed) => parsed,
                    Err(InfuseError::NoMem) => break,
                    Err(e) => {
                        warn!(mask = self.mask.bits(), error = %e, "unparseable pending TDF data");
                        pending.dropped += 1;
                        break;
                    }
                };
                let (format, field) = match parsed.data_type {
                    TdfDataType::Single => (TdfFormat::TimeArray, 0),
                    TdfDataType::TimeArray { period } => (TdfFormat::TimeArray, period),
                    TdfDataType::IdxArray { start_idx } => (TdfFormat::IdxArray, start_idx),
                };
                if let Err(e) = self.log_locked(
                    &mut pending,
                    parsed.id,
                    parsed.len,
                    parsed.count,
                    format,
                    parsed.time,
                    field,
                    parsed.data,
                ) {
                    warn!(
                        mask = self.mask.bits(),
                        id = parsed.id,
                        error = %e,
                        "TDF lost on block size update"
                    );
                    pending.dropped += 1;
                    self.logger.report_failure(self.block_type, parsed.data, &e);
                }
            }
        }
    }
}

/// Routes each record to every backend selected by a mask.
#[derive(Default)]
pub struct TdfLogger {
    config: TdfConfig,
    /// Sorted by mask bit
    backends: Vec<Arc<TdfBackend>>,
}

impl TdfLogger {
    pub fn new(config: TdfConfig) -> Self {
        TdfLogger {
            config,
            backends: Vec::new(),
        }
    }

    fn attach(
        &mut self,
        mask: LoggerMask,
        logger: Arc<DataLogger>,
        block_type: InfuseType,
    ) -> InfuseResult<Arc<TdfBackend>> {
        if mask.bits().count_ones() != 1 {
            return Err(InfuseError::invalid(format!(
                "backend mask {:#04x} must select exactly one bit",
                mask.bits()
            )));
        }
        if self.backend(mask).is_some() {
            return Err(InfuseError::AlreadyExists);
        }
        let backend = TdfBackend::new(mask, logger, block_type, &self.config);
        self.backends.push(backend.clone());
        self.backends.sort_by_key(|b| b.mask.bits());
        Ok(backend)
    }

    pub fn add_backend(&mut self, mask: LoggerMask, logger: Arc<DataLogger>) -> InfuseResult<Arc<TdfBackend>> {
        self.attach(mask, logger, InfuseType::Tdf)
    }

    /// A backend whose blocks carry a 64-bit remote device id prefix.
    pub fn add_remote_backend(
        &mut self,
        mask: LoggerMask,
        logger: Arc<DataLogger>,
    ) -> InfuseResult<Arc<TdfBackend>> {
        self.attach(mask, logger, InfuseType::TdfRemote)
    }

    pub fn backend(&self, mask: LoggerMask) -> Option<&Arc<TdfBackend>> {
        self.backends.iter().find(|b| b.mask == mask)
    }

    fn selected(&self, mask: LoggerMask) -> impl Iterator<Item = &Arc<TdfBackend>> {
        self.backends.iter().filter(move |b| mask.contains(b.mask))
    }

    /// Log a single record or time array of `count` samples `period`
    /// epoch ticks apart.
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        mask: LoggerMask,
        id: u16,
        len: u8,
        count: u16,
        time: u64,
        period: u32,
        data: &[u8],
    ) -> InfuseResult<()> {
        self.log_core(mask, id, len, count, TdfFormat::TimeArray, time, period, data)
    }

    /// Log `count` samples indexed from `start_idx`.
    #[allow(clippy::too_many_arguments)]
    pub fn log_idx(
        &self,
        mask: LoggerMask,
        id: u16,
        len: u8,
        count: u16,
        time: u64,
        start_idx: u32,
        data: &[u8],
    ) -> InfuseResult<()> {
        self.log_core(mask, id, len, count, TdfFormat::IdxArray, time, start_idx, data)
    }

    /// Every selected backend is attempted; the first failure is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn log_core(
        &self,
        mask: LoggerMask,
        id: u16,
        len: u8,
        count: u16,
        format: TdfFormat,
        time: u64,
        idx_period: u32,
        data: &[u8],
    ) -> InfuseResult<()> {
        let mut first_err = None;
        for backend in self.selected(mask) {
            if let Err(e) = backend.log_core(id, len, count, format, time, idx_period, data) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn flush(&self, mask: LoggerMask) -> InfuseResult<()> {
        let mut first_err = None;
        for backend in self.selected(mask) {
            if let Err(e) = backend.flush() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
