//! Metadata slot encoding
//!
//! A slot is the persisted state of one log: both translation tables and
//! the info page. Only the info record is checksummed: tables written ahead
//! of it only ever add mappings, so a stale record over newer tables is a
//! valid slot.

use crate::config::Layout;
use crate::error::{NvlogError, Result};
use crate::space::AddressSpace;

use super::{INFO_PAGE_SIZE, INFO_RECORD_SIZE, INVALID_VERSION, MAX_NAME_LEN};

// Field offsets inside the info page
const NAME_AT: usize = 0;
const NAME_FIELD: usize = 256;
const ID_AT: usize = 256;
const HEAD_AT: usize = 264;
const TAIL_AT: usize = 272;
const VERSION_AT: usize = 280;
const IN_USE_AT: usize = 288;
const CRC_AT: usize = 292;

// =============================================================================
// LogInfo
// =============================================================================

/// Bookkeeping part of a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInfo {
    /// Name of the log
    pub name: String,
    /// Slot index, doubling as the log id
    pub id: u32,
    /// Index of the first live entry
    pub head: i64,
    /// Index one past the last committed entry
    pub tail: i64,
    /// Latest committed version
    pub version: i64,
    /// Whether the slot belongs to a log
    pub in_use: bool,
}

impl LogInfo {
    /// Info of a newly created log
    pub fn fresh(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
            head: 0,
            tail: 0,
            version: INVALID_VERSION,
            in_use: true,
        }
    }

    /// Info of a slot nobody owns
    pub fn unused(id: u32) -> Self {
        Self {
            name: String::new(),
            id,
            head: 0,
            tail: 0,
            version: INVALID_VERSION,
            in_use: false,
        }
    }

    /// Copy with a new tail and version, as produced by an append
    pub fn advanced(&self, tail: i64, version: i64) -> Self {
        Self {
            tail,
            version,
            ..self.clone()
        }
    }

    /// Number of committed entries between head and tail
    pub fn len(&self) -> u64 {
        (self.tail - self.head).max(0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `name` fits the on-device name field
    pub fn check_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(NvlogError::InvalidArgument("Log name is empty".to_string()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NvlogError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        if name.as_bytes().contains(&0) {
            return Err(NvlogError::InvalidArgument(
                "Log name contains a NUL byte".to_string(),
            ));
        }
        Ok(())
    }

    fn encode_into(&self, page: &mut [u8]) -> Result<()> {
        if self.in_use || !self.name.is_empty() {
            Self::check_name(&self.name)?;
        }

        page[NAME_AT..NAME_AT + NAME_FIELD].fill(0);
        page[NAME_AT..NAME_AT + self.name.len()].copy_from_slice(self.name.as_bytes());
        page[ID_AT..ID_AT + 4].copy_from_slice(&self.id.to_le_bytes());
        page[HEAD_AT..HEAD_AT + 8].copy_from_slice(&self.head.to_le_bytes());
        page[TAIL_AT..TAIL_AT + 8].copy_from_slice(&self.tail.to_le_bytes());
        page[VERSION_AT..VERSION_AT + 8].copy_from_slice(&self.version.to_le_bytes());
        page[IN_USE_AT] = self.in_use as u8;
        Ok(())
    }

    fn decode(page: &[u8], slot: u32) -> Result<Self> {
        let name_field = &page[NAME_AT..NAME_AT + NAME_FIELD];
        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|e| NvlogError::CorruptMetadata {
                slot,
                reason: format!("name is not UTF-8: {}", e),
            })?
            .to_string();

        let i64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&page[at..at + 8]);
            i64::from_le_bytes(raw)
        };
        let mut id = [0u8; 4];
        id.copy_from_slice(&page[ID_AT..ID_AT + 4]);

        Ok(Self {
            name,
            id: u32::from_le_bytes(id),
            head: i64_at(HEAD_AT),
            tail: i64_at(TAIL_AT),
            version: i64_at(VERSION_AT),
            in_use: page[IN_USE_AT] != 0,
        })
    }
}

// =============================================================================
// AddressTable
// =============================================================================

/// Virtual segment index → physical segment id, for both spaces of a log.
/// `0` marks an unmapped entry (segment 0 holds the metadata array).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTable {
    log_entry: Vec<u16>,
    data: Vec<u16>,
}

impl AddressTable {
    /// All-unmapped tables sized for `layout`
    pub fn new(layout: &Layout) -> Self {
        Self {
            log_entry: vec![0; layout.log_entry_table_len],
            data: vec![0; layout.data_table_len],
        }
    }

    pub fn table(&self, space: AddressSpace) -> &[u16] {
        match space {
            AddressSpace::LogEntry => &self.log_entry,
            AddressSpace::Data => &self.data,
        }
    }

    fn table_mut(&mut self, space: AddressSpace) -> &mut [u16] {
        match space {
            AddressSpace::LogEntry => &mut self.log_entry,
            AddressSpace::Data => &mut self.data,
        }
    }

    /// Number of virtual segments in `space`
    pub fn len(&self, space: AddressSpace) -> usize {
        self.table(space).len()
    }

    /// Physical segment behind a virtual segment, `None` if unmapped
    /// or past the end of the table
    pub fn get(&self, space: AddressSpace, index: usize) -> Option<u16> {
        self.table(space).get(index).copied().filter(|&seg| seg != 0)
    }

    /// Map a virtual segment; panics if `index` is past the table
    pub fn set(&mut self, space: AddressSpace, index: usize, segment: u16) {
        self.table_mut(space)[index] = segment;
    }

    /// Every mapped physical segment, log-entry space first
    pub fn mapped_segments(&self) -> impl Iterator<Item = u16> + '_ {
        self.log_entry
            .iter()
            .chain(self.data.iter())
            .copied()
            .filter(|&seg| seg != 0)
    }

    fn encode_into(&self, buf: &mut [u8]) {
        let words = self.log_entry.iter().chain(self.data.iter());
        for (chunk, word) in buf.chunks_exact_mut(2).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }

    fn decode(buf: &[u8], layout: &Layout) -> Self {
        let mut words = buf
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]));
        let log_entry = words.by_ref().take(layout.log_entry_table_len).collect();
        let data = words.take(layout.data_table_len).collect();
        Self { log_entry, data }
    }
}

// =============================================================================
// LogMetadataSlot
// =============================================================================

/// One slot of the global metadata array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMetadataSlot {
    pub table: AddressTable,
    pub info: LogInfo,
}

impl LogMetadataSlot {
    /// Unowned slot with empty tables
    pub fn unused(layout: &Layout, id: u32) -> Self {
        Self {
            table: AddressTable::new(layout),
            info: LogInfo::unused(id),
        }
    }

    /// Slot of a newly created log
    pub fn fresh(layout: &Layout, id: u32, name: &str) -> Self {
        Self {
            table: AddressTable::new(layout),
            info: LogInfo::fresh(name, id),
        }
    }

    /// Placeholder for a slot whose info record cannot be trusted
    ///
    /// Keeps whatever the tables hold so their segments can stay reserved,
    /// and the name when it still reads as a valid one.
    pub fn salvage(buf: &[u8], layout: &Layout, slot: u32) -> (Self, Option<String>) {
        let table_bytes = layout.address_table_bytes();
        let table = if buf.len() >= table_bytes {
            AddressTable::decode(&buf[..table_bytes], layout)
        } else {
            AddressTable::new(layout)
        };
        let name = buf
            .get(table_bytes + NAME_AT..table_bytes + NAME_AT + NAME_FIELD)
            .and_then(|field| {
                let len = field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
                std::str::from_utf8(&field[..len]).ok()
            })
            .filter(|name| LogInfo::check_name(name).is_ok())
            .map(str::to_string);
        let placeholder = Self {
            table,
            info: LogInfo::unused(slot),
        };
        (placeholder, name)
    }

    /// Encode into exactly `layout.slot_size(sector_size)` bytes
    pub fn encode(&self, layout: &Layout, sector_size: u32) -> Result<Vec<u8>> {
        let table_bytes = layout.address_table_bytes();
        let mut buf = vec![0u8; layout.slot_size(sector_size)];

        self.table.encode_into(&mut buf[..table_bytes]);
        self.info
            .encode_into(&mut buf[table_bytes..table_bytes + INFO_PAGE_SIZE])?;

        let record = &mut buf[table_bytes..table_bytes + INFO_RECORD_SIZE];
        let crc = crc32fast::hash(record);
        record[CRC_AT..CRC_AT + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decode slot `slot` from its on-device bytes
    ///
    /// Slots not marked in use decode as unused regardless of content. In-use
    /// slots must carry a matching checksum and their own id.
    pub fn decode(buf: &[u8], layout: &Layout, slot: u32) -> Result<Self> {
        let table_bytes = layout.address_table_bytes();
        if buf.len() < table_bytes + INFO_PAGE_SIZE {
            return Err(NvlogError::CorruptMetadata {
                slot,
                reason: format!("slot image is only {} bytes", buf.len()),
            });
        }

        let page = &buf[table_bytes..table_bytes + INFO_PAGE_SIZE];
        if page[IN_USE_AT] == 0 {
            return Ok(Self::unused(layout, slot));
        }

        let mut stored = [0u8; 4];
        stored.copy_from_slice(&page[CRC_AT..CRC_AT + 4]);
        let stored = u32::from_le_bytes(stored);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page[..CRC_AT]);
        hasher.update(&[0u8; 4]);
        hasher.update(&page[CRC_AT + 4..INFO_RECORD_SIZE]);
        let computed = hasher.finalize();

        if stored != computed {
            return Err(NvlogError::CorruptMetadata {
                slot,
                reason: format!("checksum mismatch: stored {:#010x}, computed {:#010x}", stored, computed),
            });
        }

        let info = LogInfo::decode(page, slot)?;
        if info.id != slot {
            return Err(NvlogError::CorruptMetadata {
                slot,
                reason: format!("slot records id {}", info.id),
            });
        }

        Ok(Self {
            table: AddressTable::decode(&buf[..table_bytes], layout),
            info,
        })
    }
}
