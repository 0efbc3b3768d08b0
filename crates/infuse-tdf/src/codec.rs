//! TDF encoding into a bounded buffer

use infuse_core::{InfuseError, InfuseResult};

use crate::*;

/// Array encoding requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdfFormat {
    /// Samples evenly spaced in time, `period` in epoch ticks
    TimeArray,
    /// Samples identified by a monotonic index
    IdxArray,
}

/// Bounded TDF output buffer.
///
/// `time` is the epoch time of the last timestamped record, the base for the
/// next relative timestamp. It is 0 while no timestamped record is present.
#[derive(Debug, Clone)]
pub struct TdfBuffer {
    buf: Vec<u8>,
    capacity: usize,
    pub time: u64,
}

fn fits_signed(delta: i128, bits: u32) -> bool {
    let max = (1i128 << (bits - 1)) - 1;
    let min = -(1i128 << (bits - 1));
    (min..=max).contains(&delta)
}

impl TdfBuffer {
    pub fn new(capacity: usize) -> Self {
        TdfBuffer {
            buf: Vec::with_capacity(capacity),
            capacity,
            time: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the usable size. Pending data beyond the new size is kept but
    /// no further records are accepted until the buffer is reset.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn tailroom(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.time = 0;
    }

    /// Append `count` records of `len` bytes each as a single value or time array.
    ///
    /// Returns the number of records added, which may be less than `count`
    /// when only part of the array fits.
    pub fn add(
        &mut self,
        id: u16,
        len: u8,
        count: u8,
        time: u64,
        period: u32,
        data: &[u8],
    ) -> InfuseResult<u8> {
        self.add_core(id, len, count, time, TdfFormat::TimeArray, period, data)
    }

    /// Append `count` records as an index array starting at `start_idx`.
    pub fn add_idx(
        &mut self,
        id: u16,
        len: u8,
        count: u8,
        time: u64,
        start_idx: u32,
        data: &[u8],
    ) -> InfuseResult<u8> {
        self.add_core(id, len, count, time, TdfFormat::IdxArray, start_idx, data)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_core(
        &mut self,
        id: u16,
        len: u8,
        count: u8,
        time: u64,
        format: TdfFormat,
        field: u32,
        data: &[u8],
    ) -> InfuseResult<u8> {
        if id == 0 || id > TDF_ID_MAX || len == 0 || count == 0 {
            return Err(InfuseError::invalid(format!("bad TDF {id}/{len}/{count}")));
        }
        if field > TDF_ARRAY_FIELD_MAX {
            return Err(InfuseError::invalid("array period/index exceeds 24 bits"));
        }
        if data.len() < len as usize * count as usize {
            return Err(InfuseError::invalid("TDF data shorter than len * count"));
        }
        let idx = format == TdfFormat::IdxArray;

        // Can never fit, even in an empty buffer
        let min_size = TDF_HEADER_SIZE
            + if time != 0 { TDF_ABSOLUTE_SIZE } else { 0 }
            + if idx { TDF_ARRAY_HEADER_SIZE } else { 0 }
            + len as usize;
        if min_size > self.capacity {
            return Err(InfuseError::NoSpace);
        }

        let mut delta: i64 = 0;
        let (ts_flag, ts_size) = if time == 0 {
            (TDF_TIMESTAMP_NONE, 0)
        } else if self.time == 0 {
            (TDF_TIMESTAMP_ABSOLUTE, TDF_ABSOLUTE_SIZE)
        } else {
            let d = time as i128 - self.time as i128;
            if fits_signed(d, 16) {
                delta = d as i64;
                (TDF_TIMESTAMP_RELATIVE, TDF_RELATIVE_SIZE)
            } else if fits_signed(d, 48) {
                delta = d as i64;
                (TDF_TIMESTAMP_EXTENDED_RELATIVE, TDF_EXTENDED_RELATIVE_SIZE)
            } else {
                (TDF_TIMESTAMP_ABSOLUTE, TDF_ABSOLUTE_SIZE)
            }
        };

        let mut count = count;
        let mut array_size = if idx || count > 1 {
            TDF_ARRAY_HEADER_SIZE
        } else {
            0
        };
        let total_header = TDF_HEADER_SIZE + ts_size + array_size;
        let remaining = self.tailroom();
        if remaining <= total_header {
            return Err(InfuseError::NoMem);
        }

        let mut payload_space = remaining - total_header;
        if payload_space < len as usize * count as usize {
            let mut can_fit = payload_space / len as usize;
            if can_fit == 0 && array_size > 0 && !idx {
                // Reclaim the array header space and re-evaluate
                payload_space += array_size;
                array_size = 0;
                // A record without an array header holds one sample
                can_fit = (payload_space / len as usize).min(1);
            }
            if can_fit == 0 {
                return Err(InfuseError::NoMem);
            }
            count = can_fit as u8;
        }
        if count == 1 && !idx {
            array_size = 0;
        }

        let array_flag = match (array_size, format) {
            (0, _) => TDF_ARRAY_NONE,
            (_, TdfFormat::TimeArray) => TDF_ARRAY_TIME,
            (_, TdfFormat::IdxArray) => TDF_ARRAY_IDX,
        };
        let id_flags = ts_flag | array_flag | id;
        self.buf.extend_from_slice(&id_flags.to_le_bytes());
        self.buf.push(len);

        match ts_flag {
            TDF_TIMESTAMP_ABSOLUTE => self.buf.extend_from_slice(&time.to_le_bytes()),
            TDF_TIMESTAMP_RELATIVE => self.buf.extend_from_slice(&(delta as i16).to_le_bytes()),
            TDF_TIMESTAMP_EXTENDED_RELATIVE => {
                self.buf.extend_from_slice(&delta.to_le_bytes()[..TDF_EXTENDED_RELATIVE_SIZE])
            }
            _ => {}
        }
        if time != 0 {
            self.time = time;
        }

        if array_size > 0 {
            self.buf.push(count);
            self.buf.extend_from_slice(&field.to_le_bytes()[..3]);
        }
        self.buf
            .extend_from_slice(&data[..len as usize * count as usize]);
        Ok(count)
    }
}
