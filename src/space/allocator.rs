//! Segment Allocator
//!
//! One bit per physical segment, `1` = allocated. Segment 0 is reserved for
//! the metadata array and is set from the start. Segments are never freed
//! while the engine runs; the bitset is rebuilt from the persisted address
//! tables at every open.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{NvlogError, Result};

/// Physical segment ids are stored as u16 in the address tables
pub const MAX_SEGMENTS: usize = u16::MAX as usize + 1;

const WORD_BITS: usize = 64;

pub struct SegmentAllocator {
    /// Usage bitset; the allocation lock
    words: Mutex<Vec<u64>>,
    /// Number of valid bits
    total: usize,
    /// Set bits, for cheap stats reads outside the lock
    used: AtomicUsize,
}

impl SegmentAllocator {
    /// Track `total` segments (clamped to what a u16 id can name)
    pub fn new(total: usize) -> Self {
        let total = total.clamp(1, MAX_SEGMENTS);
        let mut words = vec![0u64; total.div_ceil(WORD_BITS)];

        // Bits past `total` in the last word are marked used so the scan
        // never returns them
        let tail = total % WORD_BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }
        words[0] |= 1; // segment 0: metadata array

        Self {
            words: Mutex::new(words),
            total,
            used: AtomicUsize::new(1),
        }
    }

    /// Allocate the lowest free segment
    pub fn allocate(&self) -> Result<u16> {
        let mut words = self.words.lock();
        for (i, word) in words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                self.used.fetch_add(1, Ordering::Relaxed);
                let segment = i * WORD_BITS + bit;
                tracing::trace!("Allocated segment {}", segment);
                return Ok(segment as u16);
            }
        }
        Err(NvlogError::NoFreeSegment { total: self.total })
    }

    /// Mark a segment referenced by a persisted table.
    /// Returns false if it was already taken (or out of range).
    pub fn mark_used(&self, segment: u16) -> bool {
        let segment = segment as usize;
        if segment >= self.total {
            return false;
        }
        let mut words = self.words.lock();
        let (word, bit) = (segment / WORD_BITS, segment % WORD_BITS);
        if words[word] & (1 << bit) != 0 {
            return false;
        }
        words[word] |= 1 << bit;
        self.used.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn is_used(&self, segment: u16) -> bool {
        let segment = segment as usize;
        if segment >= self.total {
            return false;
        }
        self.words.lock()[segment / WORD_BITS] & (1 << (segment % WORD_BITS)) != 0
    }

    /// Segments tracked, including the reserved one
    pub fn total(&self) -> usize {
        self.total
    }

    /// Segments allocated, including the reserved one
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn free(&self) -> usize {
        self.total - self.used()
    }
}
