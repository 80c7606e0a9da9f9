//! Space Module
//!
//! Physical segment allocation and per-log virtual → physical translation.
//!
//! ## Address Translation
//! ```text
//!   virtual offset (log-entry or data space of one log)
//!   ┌──────────────────────────┬─────────────────────────────┐
//!   │ segment index (hi bits)  │ offset in segment (lo bits) │
//!   └────────────┬─────────────┴──────────────┬──────────────┘
//!                │ AddressTable[space][index] │
//!                ▼                            │
//!        physical segment id ── << bits ──────┴──► device byte ──► LBA
//! ```
//!
//! An unmapped table entry gets a fresh segment from the allocator the
//! first time a write touches it. Reads never allocate.

mod allocator;
mod translate;

use std::fmt;

pub use allocator::SegmentAllocator;
pub use translate::{AddressTranslator, Span};

/// The two virtual address spaces every log owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// Fixed-size log entries
    LogEntry,
    /// Payload bytes
    Data,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::LogEntry => write!(f, "log-entry"),
            AddressSpace::Data => write!(f, "data"),
        }
    }
}
