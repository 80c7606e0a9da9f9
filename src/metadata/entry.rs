//! Log entry record

use crate::error::{NvlogError, Result};

use super::LOG_ENTRY_SIZE;

/// One record in a log's log-entry space, describing one append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogEntry {
    /// Version of the appended data
    pub version: i64,
    /// Length of the payload in bytes
    pub data_length: u64,
    /// Offset of the payload in the log's data space
    pub data_offset: u64,
    /// Wall-clock component of the hybrid logical clock
    pub hlc_realtime: u64,
    /// Logical component of the hybrid logical clock
    pub hlc_logical: u64,
}

impl LogEntry {
    pub fn new(version: i64, data_offset: u64, data_length: u64) -> Self {
        Self {
            version,
            data_length,
            data_offset,
            hlc_realtime: 0,
            hlc_logical: 0,
        }
    }

    /// Attach a hybrid logical clock timestamp
    pub fn with_hlc(mut self, realtime: u64, logical: u64) -> Self {
        self.hlc_realtime = realtime;
        self.hlc_logical = logical;
        self
    }

    /// First byte past the payload in the data space
    pub fn data_end(&self) -> u64 {
        self.data_offset + self.data_length
    }

    pub fn encode(&self) -> [u8; LOG_ENTRY_SIZE] {
        let mut buf = [0u8; LOG_ENTRY_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Write the record into the first 64 bytes of `buf`
    pub fn encode_into(&self, buf: &mut [u8]) {
        let buf = &mut buf[..LOG_ENTRY_SIZE];
        buf.fill(0);
        buf[0..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.data_length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.hlc_realtime.to_le_bytes());
        buf[32..40].copy_from_slice(&self.hlc_logical.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < LOG_ENTRY_SIZE {
            return Err(NvlogError::InvalidArgument(format!(
                "Log entry needs {} bytes, got {}",
                LOG_ENTRY_SIZE,
                buf.len()
            )));
        }
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Ok(Self {
            version: u64_at(0) as i64,
            data_length: u64_at(8),
            data_offset: u64_at(16),
            hlc_realtime: u64_at(24),
            hlc_logical: u64_at(32),
        })
    }
}
