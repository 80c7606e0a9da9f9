//! Device Module
//!
//! The device-facing contract of the engine: a block device that exposes its
//! sector geometry and hands out hardware queue pairs.
//!
//! ## Responsibilities
//! - Describe sector geometry (sector size, max sectors per I/O, capacity)
//! - Accept asynchronous read/write commands on a queue pair
//! - Deliver completions by invoking the command's callback from
//!   `process_completions`, on the polling thread
//!
//! ## Command Lifecycle
//! ```text
//!   submit(cmd) ──► queue pair ──► device ──► process_completions()
//!        │                                          │
//!        │ QueueFull(cmd) (caller polls, retries)   ▼
//!        └──────────────────────────────── cmd.callback(IoCompletion)
//! ```
//!
//! Completion order is not submission order. Callers that need "all of
//! these are done" must count completions.

mod file;
mod memory;
mod probe;
mod queue_pair;

use std::fmt;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::error::Result;

pub use file::FileDevice;
pub use memory::{FaultPlan, MemDevice};
pub use probe::{ControllerInfo, DeviceProbe};
pub use queue_pair::CompletionOrder;

// =============================================================================
// Geometry
// =============================================================================

/// Sector geometry reported by an attached namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Smallest addressable unit in bytes
    pub sector_size: u32,
    /// Largest transfer a single command may carry
    pub max_sectors_per_io: u32,
    /// Namespace size in sectors
    pub capacity_sectors: u64,
}

impl Geometry {
    /// Namespace size in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * self.sector_size as u64
    }

    /// Largest transfer a single command may carry, in bytes
    pub fn max_io_bytes(&self) -> u64 {
        self.max_sectors_per_io as u64 * self.sector_size as u64
    }

    /// Round a byte count up to whole sectors
    pub fn round_up(&self, bytes: u64) -> u64 {
        let sector = self.sector_size as u64;
        bytes.div_ceil(sector) * sector
    }

    /// Whether a byte offset sits on a sector boundary
    pub fn is_aligned(&self, bytes: u64) -> bool {
        bytes % self.sector_size as u64 == 0
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Error reported by a command completion
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{count} sectors at LBA {lba} exceed capacity of {capacity} sectors")]
    OutOfRange { lba: u64, count: u32, capacity: u64 },

    #[error("Buffer of {len} bytes does not match {count} sectors")]
    BadBuffer { len: usize, count: u32 },

    #[error("Media error at LBA {lba}: {reason}")]
    Media { lba: u64, reason: String },

    #[error("Command at LBA {lba} aborted")]
    Aborted { lba: u64 },
}

// =============================================================================
// Commands
// =============================================================================

/// Buffer owned by a command while it is on the device
#[derive(Debug)]
pub enum IoBuffer {
    /// Destination of a read, filled by the device
    Read(BytesMut),
    /// Source of a write
    Write(Bytes),
}

impl IoBuffer {
    pub fn len(&self) -> usize {
        match self {
            IoBuffer::Read(buf) => buf.len(),
            IoBuffer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_write(&self) -> bool {
        matches!(self, IoBuffer::Write(_))
    }

    /// Take the filled read buffer (empty for writes)
    pub fn into_read(self) -> BytesMut {
        match self {
            IoBuffer::Read(buf) => buf,
            IoBuffer::Write(_) => BytesMut::new(),
        }
    }
}

/// What the device hands back when a command finishes
#[derive(Debug)]
pub struct IoCompletion {
    pub lba: u64,
    pub status: std::result::Result<(), DeviceError>,
    pub buffer: IoBuffer,
}

/// Continuation invoked exactly once when a command completes
pub type CompletionCallback = Box<dyn FnOnce(IoCompletion) + Send + 'static>;

/// One physical command: a sector range, its buffer and its continuation
pub struct IoCommand {
    pub lba: u64,
    pub sector_count: u32,
    pub buffer: IoBuffer,
    pub callback: CompletionCallback,
}

impl IoCommand {
    /// Build a read of `sector_count` sectors into a zeroed buffer
    pub fn read(lba: u64, sector_count: u32, sector_size: u32, callback: CompletionCallback) -> Self {
        let len = sector_count as usize * sector_size as usize;
        Self {
            lba,
            sector_count,
            buffer: IoBuffer::Read(BytesMut::zeroed(len)),
            callback,
        }
    }

    /// Build a write; `data` must already be a whole number of sectors
    pub fn write(lba: u64, data: Bytes, sector_size: u32, callback: CompletionCallback) -> Self {
        let sector_count = (data.len() / sector_size as usize) as u32;
        Self {
            lba,
            sector_count,
            buffer: IoBuffer::Write(data),
            callback,
        }
    }

    pub fn is_write(&self) -> bool {
        self.buffer.is_write()
    }

    /// Consume the command, handing its buffer and status to the callback
    pub fn complete(self, status: std::result::Result<(), DeviceError>) {
        let completion = IoCompletion {
            lba: self.lba,
            status,
            buffer: self.buffer,
        };
        (self.callback)(completion);
    }
}

impl fmt::Debug for IoCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoCommand")
            .field("lba", &self.lba)
            .field("sector_count", &self.sector_count)
            .field("write", &self.is_write())
            .finish()
    }
}

/// Why a queue pair refused a command; the command is handed back
#[derive(Debug)]
pub enum SubmitError {
    /// Every hardware slot is taken; reap completions and retry
    QueueFull(IoCommand),
    /// The command can never succeed (bad range or buffer)
    Rejected(IoCommand, DeviceError),
}

// =============================================================================
// Traits
// =============================================================================

/// A hardware submission/completion queue pair
///
/// Owned by exactly one polling thread.
pub trait QueuePair: Send {
    /// Queue a command on the device
    fn submit(&mut self, cmd: IoCommand) -> std::result::Result<(), SubmitError>;

    /// Reap up to `max` finished commands, invoking their callbacks.
    /// Returns how many completed.
    fn process_completions(&mut self, max: usize) -> usize;

    /// Commands submitted but not yet completed
    fn outstanding(&self) -> usize;
}

/// An attached namespace
pub trait BlockDevice: Send + Sync + 'static {
    /// Sector geometry of the namespace
    fn geometry(&self) -> Geometry;

    /// Allocate a fresh queue pair with room for `depth` commands
    fn alloc_queue_pair(&self, depth: u32) -> Result<Box<dyn QueuePair>>;
}
