//! Device Address Translator
//!
//! Holds the *working* address tables of every log. They may be ahead of
//! the persisted tables in the metadata store: a segment allocated by an
//! in-flight append is mapped here first and reaches the device with that
//! append's metadata write.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Layout;
use crate::device::Geometry;
use crate::error::{NvlogError, Result};
use crate::metadata::AddressTable;

use super::{AddressSpace, SegmentAllocator};

/// Contiguous physical run backing part of a virtual range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// First sector on the device
    pub lba: u64,
    /// Sectors in the run
    pub sectors: u32,
    /// Position of the run inside the requested virtual range, in bytes
    pub buf_offset: usize,
    /// Length of the run in bytes
    pub len: usize,
}

pub struct AddressTranslator {
    layout: Layout,
    geometry: Geometry,
    allocator: Arc<SegmentAllocator>,
    tables: Vec<Mutex<AddressTable>>,
}

impl AddressTranslator {
    /// Build from one table per slot, in slot order
    pub fn new(
        layout: Layout,
        geometry: Geometry,
        allocator: Arc<SegmentAllocator>,
        tables: Vec<AddressTable>,
    ) -> Self {
        Self {
            layout,
            geometry,
            allocator,
            tables: tables.into_iter().map(Mutex::new).collect(),
        }
    }

    fn table(&self, log_id: u32) -> Result<&Mutex<AddressTable>> {
        self.tables
            .get(log_id as usize)
            .ok_or(NvlogError::UnknownLog(log_id))
    }

    fn table_len(&self, space: AddressSpace) -> usize {
        match space {
            AddressSpace::LogEntry => self.layout.log_entry_table_len,
            AddressSpace::Data => self.layout.data_table_len,
        }
    }

    fn check_index(&self, log_id: u32, space: AddressSpace, segment_index: u64) -> Result<()> {
        let table_len = self.table_len(space);
        if segment_index >= table_len as u64 {
            return Err(NvlogError::AddressSpaceExhausted {
                log_id,
                space,
                segment_index,
                table_len,
            });
        }
        Ok(())
    }

    /// Device byte address of a virtual offset
    ///
    /// With `allocate`, an unmapped segment is allocated and mapped; without
    /// it, an unmapped segment is an error.
    pub fn translate(
        &self,
        log_id: u32,
        space: AddressSpace,
        offset: u64,
        allocate: bool,
    ) -> Result<u64> {
        let segment_index = offset >> self.layout.segment_bits;
        self.check_index(log_id, space, segment_index)?;

        let mut table = self.table(log_id)?.lock();
        let segment = match table.get(space, segment_index as usize) {
            Some(segment) => segment,
            None if allocate => {
                let segment = self.allocator.allocate()?;
                table.set(space, segment_index as usize, segment);
                tracing::debug!(
                    "Log {} mapped {} segment {} -> physical {}",
                    log_id,
                    space,
                    segment_index,
                    segment
                );
                segment
            }
            None => {
                return Err(NvlogError::SegmentUnmapped {
                    log_id,
                    space,
                    segment_index,
                })
            }
        };

        Ok(((segment as u64) << self.layout.segment_bits) | (offset & self.layout.segment_mask()))
    }

    /// Split a sector-aligned virtual range into physical runs
    ///
    /// Runs break at segment boundaries and at the device's transfer limit.
    /// The whole range is checked against the table length before anything
    /// is allocated, so a failing call never maps part of the range.
    pub fn spans(
        &self,
        log_id: u32,
        space: AddressSpace,
        offset: u64,
        len: u64,
        allocate: bool,
    ) -> Result<Vec<Span>> {
        let sector = self.geometry.sector_size as u64;
        if offset % sector != 0 {
            return Err(NvlogError::Misaligned {
                what: "virtual offset",
                value: offset,
                alignment: sector,
            });
        }
        if len % sector != 0 {
            return Err(NvlogError::Misaligned {
                what: "transfer length",
                value: len,
                alignment: sector,
            });
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        let last = offset
            .checked_add(len - 1)
            .ok_or_else(|| NvlogError::InvalidArgument(format!("range {}+{} overflows", offset, len)))?;
        self.check_index(log_id, space, last >> self.layout.segment_bits)?;

        let segment_size = self.layout.segment_size();
        let max_io = self.geometry.max_io_bytes().max(sector);
        let mut spans = Vec::new();
        let mut pos = offset;
        let end = offset + len;

        while pos < end {
            let segment_end = (pos | self.layout.segment_mask()) + 1;
            let run = (end.min(segment_end) - pos).min(max_io);
            let address = self.translate(log_id, space, pos, allocate)?;
            spans.push(Span {
                lba: address / sector,
                sectors: (run / sector) as u32,
                buf_offset: (pos - offset) as usize,
                len: run as usize,
            });
            pos += run;
            debug_assert!(pos <= end && run <= segment_size);
        }
        Ok(spans)
    }

    /// Copy of a log's working tables, to be persisted with its metadata
    pub fn snapshot(&self, log_id: u32) -> Result<AddressTable> {
        Ok(self.table(log_id)?.lock().clone())
    }

    pub fn allocator(&self) -> &Arc<SegmentAllocator> {
        &self.allocator
    }
}
