//! Metadata Module
//!
//! On-device records and the in-memory image of the global metadata array.
//!
//! ## Responsibilities
//! - Fixed-layout encoding of log entries and metadata slots
//! - Checksums so corrupt info records are detected at bootstrap
//! - Name → slot assignment (idempotent per name)
//! - Holding the last *persisted* snapshot of every slot
//!
//! ## Slot Format
//! ```text
//! ┌──────────────────────────┬──────────────────────────┬──────────────────┐
//! │ log-entry table (u16 x L)│ data table (u16 x D)     │ info page (4096) │
//! └──────────────────────────┴──────────────────────────┴──────────────────┘
//!
//! info page:
//! ┌───────────┬────────┬──────────┬──────────┬──────────┬─────────┬─────────┐
//! │ name(256) │ id(4)  │ head(8)  │ tail(8)  │ ver(8)   │ used(1) │ crc(4)  │
//! │ @0        │ @256   │ @264     │ @272     │ @280     │ @288    │ @292    │
//! └───────────┴────────┴──────────┴──────────┴──────────┴─────────┴─────────┘
//! ```
//!
//! The first 296 bytes of the info page form the info record. The CRC covers
//! the record only, and the record is written with a single command after
//! the table sectors, so a slot torn between the two phases still decodes
//! to its previous state plus some extra mappings.
//!
//! ## Log Entry Format (64 bytes)
//! ```text
//! ┌────────┬──────────┬──────────┬──────────┬──────────┬──────────────┐
//! │ ver(8) │ dlen(8)  │ dofs(8)  │ hlc_r(8) │ hlc_l(8) │ zero (24)    │
//! └────────┴──────────┴──────────┴──────────┴──────────┴──────────────┘
//! ```

mod entry;
mod slot;
mod store;

pub use entry::LogEntry;
pub use slot::{AddressTable, LogInfo, LogMetadataSlot};
pub use store::MetadataStore;

/// Size of one encoded log entry
pub const LOG_ENTRY_SIZE: usize = 64;

/// Size of the info page at the end of every slot
pub const INFO_PAGE_SIZE: usize = 4096;

/// Bytes of the info page covered by the checksum
pub const INFO_RECORD_SIZE: usize = 296;

/// Longest log name, in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Version of a log that has never been appended to
pub const INVALID_VERSION: i64 = -1;
