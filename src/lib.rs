//! # nvlog
//!
//! A crash-consistent, multi-log storage engine for NVMe namespaces with:
//! - Many independent logs on one device, each with a private virtual
//!   address space for log entries and payload
//! - On-demand segment allocation behind per-log translation tables
//! - Atomic appends: payload and log entry reach the device before the
//!   metadata that claims them
//! - Polled submission queues drained by dedicated worker threads
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │        load / append / update_metadata / read_*              │
//! └───────────┬─────────────────────────────┬───────────────────┘
//!             │                             │
//!             ▼                             ▼
//!   ┌───────────────────┐         ┌───────────────────┐
//!   │ AtomicWrite       │────────►│ MetadataStore     │
//!   │ Coordinator       │ commit  │ (slot per log)    │
//!   └─────────┬─────────┘         └───────────────────┘
//!             │ translate
//!             ▼
//!   ┌───────────────────┐         ┌───────────────────┐
//!   │ AddressTranslator │────────►│ SegmentAllocator  │
//!   │ (virtual → LBA)   │ alloc   │ (bitset)          │
//!   └─────────┬─────────┘         └───────────────────┘
//!             │
//!             ▼
//!   ┌───────────────────────────────────────────────────┐
//!   │ IoQueues: data/log-entry queue  │  metadata queue  │
//!   └───────────────────────┬───────────────────────────┘
//!                           ▼
//!                 BlockDevice / QueuePair
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod device;
pub mod metadata;
pub mod space;
pub mod io;
mod coordinator;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{NvlogError, Result};
pub use config::{Config, Layout};
pub use device::{BlockDevice, FileDevice, Geometry, MemDevice};
pub use engine::{Engine, LogMetadataView};
pub use io::{Completion, IoStats};
pub use metadata::{LogEntry, LogInfo};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of nvlog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
