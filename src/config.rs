//! Configuration for nvlog
//!
//! Centralized configuration with sensible defaults. The on-device
//! [`Layout`] is part of the configuration because the same values must be
//! used every time a device is opened.

use std::ops::Range;

use crate::device::Geometry;
use crate::error::{NvlogError, Result};
use crate::metadata::{INFO_PAGE_SIZE, INFO_RECORD_SIZE, LOG_ENTRY_SIZE};

/// Main configuration for an nvlog engine
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Layout Configuration
    // -------------------------------------------------------------------------
    /// On-device layout (segment size, table lengths, slot count)
    pub layout: Layout,

    // -------------------------------------------------------------------------
    // I/O Configuration
    // -------------------------------------------------------------------------
    /// Number of worker threads draining the data/log-entry queue.
    /// Each worker owns one hardware queue pair.
    pub io_threads: usize,

    /// Depth requested for every hardware queue pair
    pub queue_depth: u32,

    /// Max completions reaped per poll of a queue pair
    pub completion_batch: usize,

    // -------------------------------------------------------------------------
    // Device Configuration
    // -------------------------------------------------------------------------
    /// Only attach to the controller with this transport address.
    /// `None` attaches to the first controller offered.
    pub transport_filter: Option<String>,
}

/// On-device layout
///
/// ```text
/// segment 0 (reserved)                     segments 1..N (allocated on demand)
/// ┌──────────┬──────────┬─────┬──────────┐ ┌──────────┐ ┌──────────┐
/// │ slot 0   │ slot 1   │ ... │ slot M-1 │ │ log data │ │ entries  │ ...
/// └──────────┴──────────┴─────┴──────────┘ └──────────┘ └──────────┘
///
/// slot: [log-entry table: u16 x L][data table: u16 x D][info page: 4096]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// log2 of the segment size
    pub segment_bits: u32,

    /// Number of metadata slots (max concurrently existing logs)
    pub max_logs: usize,

    /// Virtual segments addressable in each log's log-entry space
    pub log_entry_table_len: usize,

    /// Virtual segments addressable in each log's data space
    pub data_table_len: usize,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            segment_bits: 26, // 64 MB
            max_logs: 1 << 10,
            log_entry_table_len: 1 << 11,
            data_table_len: 3 << 12,
        }
    }
}

impl Layout {
    /// Segment size in bytes
    pub fn segment_size(&self) -> u64 {
        1u64 << self.segment_bits
    }

    /// Mask selecting the offset inside a segment
    pub fn segment_mask(&self) -> u64 {
        self.segment_size() - 1
    }

    /// Bytes taken by both translation tables of one slot
    pub fn address_table_bytes(&self) -> usize {
        2 * (self.log_entry_table_len + self.data_table_len)
    }

    /// Size of one metadata slot, rounded up to whole sectors
    pub fn slot_size(&self, sector_size: u32) -> usize {
        let raw = self.address_table_bytes() + INFO_PAGE_SIZE;
        let sector = sector_size as usize;
        raw.div_ceil(sector) * sector
    }

    /// Sectors of a slot, relative to its first LBA, holding the info record
    ///
    /// These are written last, as one command, to commit a slot.
    pub fn info_record_sectors(&self, sector_size: u32) -> Range<u64> {
        let sector = sector_size as usize;
        let start = self.address_table_bytes() / sector;
        let end = (self.address_table_bytes() + INFO_RECORD_SIZE).div_ceil(sector);
        start as u64..end as u64
    }

    /// Bytes of segment 0 taken by the metadata array
    pub fn metadata_bytes(&self, sector_size: u32) -> u64 {
        (self.slot_size(sector_size) * self.max_logs) as u64
    }

    /// Check the layout against the geometry of an attached device
    pub fn validate(&self, geometry: &Geometry) -> Result<()> {
        let sector = geometry.sector_size as u64;

        if !sector.is_power_of_two() || sector < LOG_ENTRY_SIZE as u64 {
            return Err(NvlogError::Config(format!(
                "Sector size {} must be a power of two >= {}",
                sector, LOG_ENTRY_SIZE
            )));
        }
        if self.segment_bits >= 63 || self.segment_size() < sector {
            return Err(NvlogError::Config(format!(
                "Segment size 2^{} must be at least one sector ({} bytes)",
                self.segment_bits, sector
            )));
        }
        if self.max_logs == 0 || self.log_entry_table_len == 0 || self.data_table_len == 0 {
            return Err(NvlogError::Config(
                "max_logs and table lengths must be non-zero".to_string(),
            ));
        }
        if self.max_logs > u32::MAX as usize {
            return Err(NvlogError::Config(format!(
                "max_logs {} does not fit a u32 log id",
                self.max_logs
            )));
        }
        let metadata = self.metadata_bytes(geometry.sector_size);
        if metadata > self.segment_size() {
            return Err(NvlogError::Config(format!(
                "Metadata array ({} bytes) does not fit in segment 0 ({} bytes)",
                metadata,
                self.segment_size()
            )));
        }
        let record = self.info_record_sectors(geometry.sector_size);
        if record.end - record.start > geometry.max_sectors_per_io as u64 {
            return Err(NvlogError::Config(format!(
                "Info record spans {} sectors but the device transfers at most {}",
                record.end - record.start,
                geometry.max_sectors_per_io
            )));
        }
        if geometry.capacity_bytes() < 2 * self.segment_size() {
            return Err(NvlogError::Config(format!(
                "Device capacity {} bytes holds fewer than two segments",
                geometry.capacity_bytes()
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            io_threads: 1,
            queue_depth: 256,
            completion_batch: 64,
            transport_filter: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the whole on-device layout
    pub fn layout(mut self, layout: Layout) -> Self {
        self.config.layout = layout;
        self
    }

    /// Set the segment size as a power of two
    pub fn segment_bits(mut self, bits: u32) -> Self {
        self.config.layout.segment_bits = bits;
        self
    }

    /// Set the number of metadata slots
    pub fn max_logs(mut self, count: usize) -> Self {
        self.config.layout.max_logs = count;
        self
    }

    /// Set the length of the log-entry and data translation tables
    pub fn table_lengths(mut self, log_entry: usize, data: usize) -> Self {
        self.config.layout.log_entry_table_len = log_entry;
        self.config.layout.data_table_len = data;
        self
    }

    /// Set the number of data/log-entry I/O worker threads
    pub fn io_threads(mut self, count: usize) -> Self {
        self.config.io_threads = count.max(1);
        self
    }

    /// Set the hardware queue pair depth
    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.config.queue_depth = depth.max(1);
        self
    }

    /// Set the completion reaping batch size
    pub fn completion_batch(mut self, batch: usize) -> Self {
        self.config.completion_batch = batch.max(1);
        self
    }

    /// Only attach to the controller with this transport address
    pub fn transport_filter(mut self, addr: impl Into<String>) -> Self {
        self.config.transport_filter = Some(addr.into());
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
