//! TDF stream parsing

use infuse_core::{InfuseError, InfuseResult};

use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdfDataType {
    Single,
    TimeArray { period: u32 },
    IdxArray { start_idx: u32 },
}

/// One decoded record borrowing its payload from the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdfParsed<'a> {
    pub id: u16,
    /// Flag bits of the header word (timestamp and array kind)
    pub raw_flags: u16,
    pub len: u8,
    pub count: u8,
    /// Absolute epoch time of the first sample, 0 if untimed
    pub time: u64,
    pub data_type: TdfDataType,
    pub data: &'a [u8],
}

impl<'a> TdfParsed<'a> {
    /// Payload of sample `i`.
    pub fn sample(&self, i: usize) -> Option<&'a [u8]> {
        let len = self.len as usize;
        self.data.get(i * len..(i + 1) * len)
    }

    /// Epoch time of sample `i` for time arrays.
    pub fn sample_time(&self, i: usize) -> u64 {
        match self.data_type {
            TdfDataType::TimeArray { period } if self.time != 0 => {
                self.time + period as u64 * i as u64
            }
            _ => self.time,
        }
    }
}

/// Sequential reader over a TDF buffer.
#[derive(Debug, Clone)]
pub struct TdfParser<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Running base time for relative timestamps
    pub time: u64,
    done: bool,
}

fn sign_extend_48(raw: u64) -> i64 {
    ((raw << 16) as i64) >> 16
}

impl<'a> TdfParser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        TdfParser {
            buf,
            pos: 0,
            time: 0,
            done: false,
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let buf = self.buf;
        let out = &buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    /// Decode the next record.
    ///
    /// `NoMem` once the buffer is exhausted, `Invalid` for malformed records.
    pub fn parse(&mut self) -> InfuseResult<TdfParsed<'a>> {
        if self.remaining() <= TDF_HEADER_SIZE {
            return Err(InfuseError::NoMem);
        }
        let hdr = self.take(TDF_HEADER_SIZE);
        let id_flags = u16::from_le_bytes([hdr[0], hdr[1]]);
        let len = hdr[2];
        let id = id_flags & TDF_ID_MASK;
        let time_flags = id_flags & TDF_TIMESTAMP_MASK;
        let array_flags = id_flags & TDF_ARRAY_MASK;

        if id == 0 || id == TDF_ID_MASK {
            return Err(InfuseError::invalid(format!("reserved TDF id {id:#x}")));
        }

        let ts_size = match time_flags {
            TDF_TIMESTAMP_ABSOLUTE => TDF_ABSOLUTE_SIZE,
            TDF_TIMESTAMP_RELATIVE => TDF_RELATIVE_SIZE,
            TDF_TIMESTAMP_EXTENDED_RELATIVE => TDF_EXTENDED_RELATIVE_SIZE,
            _ => 0,
        };
        if self.remaining() <= ts_size {
            return Err(InfuseError::invalid("truncated timestamp"));
        }
        let time = match time_flags {
            TDF_TIMESTAMP_ABSOLUTE => {
                let raw = self.take(TDF_ABSOLUTE_SIZE);
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                self.time = u64::from_le_bytes(b);
                self.time
            }
            TDF_TIMESTAMP_RELATIVE | TDF_TIMESTAMP_EXTENDED_RELATIVE => {
                let delta = if time_flags == TDF_TIMESTAMP_RELATIVE {
                    let raw = self.take(TDF_RELATIVE_SIZE);
                    i16::from_le_bytes([raw[0], raw[1]]) as i64
                } else {
                    let raw = self.take(TDF_EXTENDED_RELATIVE_SIZE);
                    let mut b = [0u8; 8];
                    b[..6].copy_from_slice(raw);
                    sign_extend_48(u64::from_le_bytes(b))
                };
                if self.time == 0 {
                    return Err(InfuseError::invalid("relative timestamp without base"));
                }
                self.time = (self.time as i128 + delta as i128) as u64;
                self.time
            }
            _ => 0,
        };

        let (count, data_type) = match array_flags {
            TDF_ARRAY_NONE => (1u8, TdfDataType::Single),
            TDF_ARRAY_TIME | TDF_ARRAY_IDX => {
                if self.remaining() <= TDF_ARRAY_HEADER_SIZE {
                    return Err(InfuseError::invalid("truncated array header"));
                }
                let raw = self.take(TDF_ARRAY_HEADER_SIZE);
                let field = u32::from_le_bytes([raw[1], raw[2], raw[3], 0]);
                let ty = if array_flags == TDF_ARRAY_TIME {
                    TdfDataType::TimeArray { period: field }
                } else {
                    TdfDataType::IdxArray { start_idx: field }
                };
                (raw[0], ty)
            }
            _ => return Err(InfuseError::invalid("diff arrays are not supported")),
        };

        let data_len = len as usize * count as usize;
        if self.remaining() < data_len {
            return Err(InfuseError::invalid("truncated payload"));
        }
        let data = self.take(data_len);
        Ok(TdfParsed {
            id,
            raw_flags: id_flags & !TDF_ID_MASK,
            len,
            count,
            time,
            data_type,
            data,
        })
    }
}

impl<'a> Iterator for TdfParser<'a> {
    type Item = InfuseResult<TdfParsed<'a>>;

    /// Yields records until exhaustion; a malformed record is yielded once
    /// as an error and ends the iteration.
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.parse() {
            Err(InfuseError::NoMem) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
            Ok(p) => Some(Ok(p)),
        }
    }
}

/// Find the first record with `id` in `buf`.
pub fn find_first(buf: &[u8], id: u16) -> InfuseResult<TdfParsed<'_>> {
    let mut parser = TdfParser::new(buf);
    loop {
        match parser.parse() {
            Ok(p) if p.id == id => return Ok(p),
            Ok(_) => continue,
            Err(_) => return Err(InfuseError::NotFound),
        }
    }
}
