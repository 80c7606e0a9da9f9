//! Error types for nvlog
//!
//! Provides a unified error type for all engine operations.

use thiserror::Error;

use crate::device::DeviceError;
use crate::space::AddressSpace;

/// Result type alias using NvlogError
pub type Result<T> = std::result::Result<T, NvlogError>;

/// Unified error type for nvlog operations
#[derive(Debug, Error)]
pub enum NvlogError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    // -------------------------------------------------------------------------
    // Capacity Errors
    // -------------------------------------------------------------------------
    #[error("No free segment left on the device ({total} segments in use)")]
    NoFreeSegment { total: usize },

    #[error("Log {log_id} exhausted its {space} address space (segment {segment_index} >= {table_len})")]
    AddressSpaceExhausted {
        log_id: u32,
        space: AddressSpace,
        segment_index: u64,
        table_len: usize,
    },

    #[error("No free metadata slot ({max_logs} logs already in use)")]
    NoFreeSlot { max_logs: usize },

    // -------------------------------------------------------------------------
    // Addressing Errors
    // -------------------------------------------------------------------------
    #[error("Log {log_id} has no segment mapped at {space} segment {segment_index}")]
    SegmentUnmapped {
        log_id: u32,
        space: AddressSpace,
        segment_index: u64,
    },

    #[error("{what} {value} is not aligned to {alignment} bytes")]
    Misaligned {
        what: &'static str,
        value: u64,
        alignment: u64,
    },

    #[error("Index {index} of log {log_id} is outside the committed range [{head}, {tail})")]
    IndexOutOfRange {
        log_id: u32,
        index: i64,
        head: i64,
        tail: i64,
    },

    // -------------------------------------------------------------------------
    // Log Errors
    // -------------------------------------------------------------------------
    #[error("Unknown log id: {0}")]
    UnknownLog(u32),

    #[error("Log name is {len} bytes, at most {max} allowed")]
    NameTooLong { len: usize, max: usize },

    #[error("Stale version for log {log_id}: requested {requested}, committed {committed}")]
    StaleVersion {
        log_id: u32,
        requested: i64,
        committed: i64,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Metadata Errors
    // -------------------------------------------------------------------------
    #[error("Metadata slot {slot} is corrupt: {reason}")]
    CorruptMetadata { slot: u32, reason: String },

    // -------------------------------------------------------------------------
    // Configuration / Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No device attached")]
    NoDevice,

    #[error("Engine is shut down")]
    ShutDown,

    #[error("I/O worker(s) panicked: {0}")]
    WorkerPanicked(String),
}

impl NvlogError {
    /// Whether the error is a capacity error (device full or log out of address space)
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            NvlogError::NoFreeSegment { .. }
                | NvlogError::AddressSpaceExhausted { .. }
                | NvlogError::NoFreeSlot { .. }
        )
    }
}
