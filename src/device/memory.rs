//! RAM-backed device
//!
//! Sparse, sector-granular in-memory namespace. Clones share the same
//! medium, so dropping an engine and attaching a new one to a clone behaves
//! like a process restart over the same drive. Faults can be injected per
//! LBA range to simulate media errors and crashes.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;

use super::queue_pair::{CompletionOrder, Medium, PolledQueuePair};
use super::{BlockDevice, DeviceError, Geometry, QueuePair};

/// Injected failures, by LBA range
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Writes touching these ranges fail and leave the medium untouched
    pub fail_writes: Vec<Range<u64>>,
    /// Reads touching these ranges fail
    pub fail_reads: Vec<Range<u64>>,
}

impl FaultPlan {
    fn hits(ranges: &[Range<u64>], lba: u64, count: u64) -> bool {
        ranges.iter().any(|r| lba < r.end && r.start < lba + count)
    }
}

struct MemMedium {
    sector_size: usize,
    sectors: RwLock<HashMap<u64, Box<[u8]>>>,
    faults: Mutex<FaultPlan>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl Medium for MemMedium {
    fn read_at(&self, lba: u64, buf: &mut [u8]) -> std::result::Result<(), DeviceError> {
        let count = (buf.len() / self.sector_size) as u64;
        if FaultPlan::hits(&self.faults.lock().fail_reads, lba, count) {
            return Err(DeviceError::Media {
                lba,
                reason: "injected read fault".to_string(),
            });
        }

        let sectors = self.sectors.read();
        for (i, chunk) in buf.chunks_mut(self.sector_size).enumerate() {
            match sectors.get(&(lba + i as u64)) {
                Some(data) => chunk.copy_from_slice(data),
                None => chunk.fill(0),
            }
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_at(&self, lba: u64, buf: &[u8]) -> std::result::Result<(), DeviceError> {
        let count = (buf.len() / self.sector_size) as u64;
        if FaultPlan::hits(&self.faults.lock().fail_writes, lba, count) {
            return Err(DeviceError::Media {
                lba,
                reason: "injected write fault".to_string(),
            });
        }

        let mut sectors = self.sectors.write();
        for (i, chunk) in buf.chunks(self.sector_size).enumerate() {
            sectors.insert(lba + i as u64, chunk.to_vec().into_boxed_slice());
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// In-memory namespace
#[derive(Clone)]
pub struct MemDevice {
    geometry: Geometry,
    order: CompletionOrder,
    medium: Arc<MemMedium>,
}

impl MemDevice {
    /// Create an empty (all-zero) namespace
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            order: CompletionOrder::Fifo,
            medium: Arc::new(MemMedium {
                sector_size: geometry.sector_size as usize,
                sectors: RwLock::new(HashMap::new()),
                faults: Mutex::new(FaultPlan::default()),
                writes: AtomicU64::new(0),
                reads: AtomicU64::new(0),
            }),
        }
    }

    /// Create a namespace of `capacity_bytes` with 512-byte sectors
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self::new(Geometry {
            sector_size: 512,
            max_sectors_per_io: 256,
            capacity_sectors: capacity_bytes / 512,
        })
    }

    /// Retire queued commands in the given order (affects new queue pairs)
    pub fn with_completion_order(mut self, order: CompletionOrder) -> Self {
        self.order = order;
        self
    }

    /// Fail every write touching `lbas` until faults are cleared
    pub fn fail_writes(&self, lbas: Range<u64>) {
        self.medium.faults.lock().fail_writes.push(lbas);
    }

    /// Fail every read touching `lbas` until faults are cleared
    pub fn fail_reads(&self, lbas: Range<u64>) {
        self.medium.faults.lock().fail_reads.push(lbas);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        *self.medium.faults.lock() = FaultPlan::default();
    }

    /// Number of write commands applied to the medium
    pub fn write_count(&self) -> u64 {
        self.medium.writes.load(Ordering::Relaxed)
    }

    /// Number of read commands served by the medium
    pub fn read_count(&self) -> u64 {
        self.medium.reads.load(Ordering::Relaxed)
    }

    /// Copy `count` sectors straight off the medium, bypassing queue pairs
    pub fn peek(&self, lba: u64, count: u64) -> Vec<u8> {
        let sector = self.geometry.sector_size as usize;
        let mut buf = vec![0u8; count as usize * sector];
        let sectors = self.medium.sectors.read();
        for (i, chunk) in buf.chunks_mut(sector).enumerate() {
            if let Some(data) = sectors.get(&(lba + i as u64)) {
                chunk.copy_from_slice(data);
            }
        }
        buf
    }
}

impl BlockDevice for MemDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn alloc_queue_pair(&self, depth: u32) -> Result<Box<dyn QueuePair>> {
        Ok(Box::new(PolledQueuePair::new(
            Arc::clone(&self.medium),
            self.geometry,
            depth,
            self.order,
        )))
    }
}
