//! Metadata Store
//!
//! In-memory image of the global metadata array plus the name → slot map.
//!
//! ## Concurrency:
//! - `slots`: RwLock. Read by any thread; replaced only by [`MetadataStore::commit`],
//!   which runs after the device confirmed the new slot image is persisted.
//!   Readers therefore see a stale-but-whole slot, never a torn one.
//! - `names`: Mutex. The slot-assignment lock; held for lookup + insert only.
//!
//! ## Quarantine
//! A slot that fails to decode at bootstrap, or whose tables clash with
//! another slot, is quarantined instead of failing the whole device. It is
//! never handed out again, its salvaged name stays reserved, and loading
//! that name reports the corruption.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::config::Layout;
use crate::error::{NvlogError, Result};

use super::{LogInfo, LogMetadataSlot};

pub struct MetadataStore {
    layout: Layout,
    sector_size: u32,

    /// Last persisted snapshot of every slot
    slots: RwLock<Vec<LogMetadataSlot>>,

    /// Name → slot id for every assigned slot
    names: Mutex<HashMap<String, u32>>,

    /// Slot id → reason, for slots that can no longer be trusted
    quarantined: Mutex<HashMap<u32, String>>,
}

impl MetadataStore {
    /// Store with every slot unused (blank device)
    pub fn empty(layout: Layout, sector_size: u32) -> Self {
        let slots = (0..layout.max_logs as u32)
            .map(|id| LogMetadataSlot::unused(&layout, id))
            .collect();
        Self {
            layout,
            sector_size,
            slots: RwLock::new(slots),
            names: Mutex::new(HashMap::new()),
            quarantined: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the store from the raw metadata region of segment 0
    pub fn from_image(layout: Layout, sector_size: u32, image: &[u8]) -> Result<Self> {
        let slot_size = layout.slot_size(sector_size);
        if image.len() < slot_size * layout.max_logs {
            return Err(NvlogError::CorruptMetadata {
                slot: 0,
                reason: format!(
                    "metadata image is {} bytes, expected {}",
                    image.len(),
                    slot_size * layout.max_logs
                ),
            });
        }

        let mut slots = Vec::with_capacity(layout.max_logs);
        let mut names = HashMap::new();
        let mut quarantined = HashMap::new();
        let mut salvaged = Vec::new();

        for (id, raw) in image.chunks_exact(slot_size).take(layout.max_logs).enumerate() {
            let id = id as u32;
            let slot = match LogMetadataSlot::decode(raw, &layout, id) {
                Ok(slot) => slot,
                Err(NvlogError::CorruptMetadata { reason, .. }) => {
                    tracing::warn!("Quarantining metadata slot {}: {}", id, reason);
                    let (placeholder, name) = LogMetadataSlot::salvage(raw, &layout, id);
                    salvaged.extend(name.map(|name| (name, id)));
                    quarantined.insert(id, reason);
                    slots.push(placeholder);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if slot.info.in_use {
                match names.get(&slot.info.name).copied() {
                    Some(other) => {
                        let reason = format!(
                            "name '{}' is also claimed by slot {}",
                            slot.info.name, other
                        );
                        tracing::warn!("Quarantining metadata slot {}: {}", id, reason);
                        quarantined.insert(id, reason);
                        slots.push(LogMetadataSlot {
                            table: slot.table,
                            info: LogInfo::unused(id),
                        });
                        continue;
                    }
                    None => {
                        names.insert(slot.info.name.clone(), id);
                    }
                }
            }
            slots.push(slot);
        }

        // Intact slots keep their names over salvaged ones
        for (name, id) in salvaged {
            names.entry(name).or_insert(id);
        }

        Ok(Self {
            layout,
            sector_size,
            slots: RwLock::new(slots),
            names: Mutex::new(names),
            quarantined: Mutex::new(quarantined),
        })
    }

    // =========================================================================
    // Slot Assignment
    // =========================================================================

    /// Slot of an existing log
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.names.lock().get(name).copied()
    }

    /// Find the slot owned by `name`, or claim a free one
    ///
    /// Returns `(id, true)` when a new slot was claimed; the caller must
    /// persist it (or [`release`](Self::release) it on failure).
    pub fn assign_slot(&self, name: &str) -> Result<(u32, bool)> {
        LogInfo::check_name(name)?;

        let mut names = self.names.lock();
        if let Some(&id) = names.get(name) {
            if let Some(reason) = self.quarantined.lock().get(&id) {
                return Err(NvlogError::CorruptMetadata {
                    slot: id,
                    reason: reason.clone(),
                });
            }
            return Ok((id, false));
        }

        let mut claimed: HashSet<u32> = names.values().copied().collect();
        claimed.extend(self.quarantined.lock().keys().copied());
        let free = self
            .slots
            .read()
            .iter()
            .find(|slot| !slot.info.in_use && !claimed.contains(&slot.info.id))
            .map(|slot| slot.info.id);

        match free {
            Some(id) => {
                names.insert(name.to_string(), id);
                tracing::info!("Assigned metadata slot {} to log '{}'", id, name);
                Ok((id, true))
            }
            None => Err(NvlogError::NoFreeSlot {
                max_logs: self.layout.max_logs,
            }),
        }
    }

    /// Undo an assignment whose slot never got persisted
    pub fn release(&self, name: &str) {
        let mut names = self.names.lock();
        if let Some(id) = names.get(name).copied() {
            let persisted = self.slots.read()[id as usize].info.in_use;
            if !persisted {
                names.remove(name);
                tracing::debug!("Released unpersisted slot {} of log '{}'", id, name);
            }
        }
    }

    // =========================================================================
    // Slot Access
    // =========================================================================

    /// Last persisted snapshot of a slot
    pub fn read_slot(&self, id: u32) -> Result<LogMetadataSlot> {
        self.slots
            .read()
            .get(id as usize)
            .cloned()
            .ok_or(NvlogError::UnknownLog(id))
    }

    /// Last persisted info of a slot
    pub fn read_info(&self, id: u32) -> Result<LogInfo> {
        self.slots
            .read()
            .get(id as usize)
            .map(|slot| slot.info.clone())
            .ok_or(NvlogError::UnknownLog(id))
    }

    /// Install a slot image the device has confirmed
    pub fn commit(&self, slot: LogMetadataSlot) {
        let id = slot.info.id as usize;
        let mut slots = self.slots.write();
        if let Some(current) = slots.get_mut(id) {
            *current = slot;
        }
    }

    /// Take a slot out of service, keeping its tables for segment accounting
    pub fn quarantine(&self, id: u32, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("Quarantining metadata slot {}: {}", id, reason);
        if let Some(slot) = self.slots.write().get_mut(id as usize) {
            slot.info = LogInfo::unused(id);
        }
        self.quarantined.lock().insert(id, reason);
    }

    pub fn is_quarantined(&self, id: u32) -> bool {
        self.quarantined.lock().contains_key(&id)
    }

    /// Quarantined slots and why, ordered by id
    pub fn quarantined(&self) -> Vec<(u32, String)> {
        let mut slots: Vec<_> = self
            .quarantined
            .lock()
            .iter()
            .map(|(&id, reason)| (id, reason.clone()))
            .collect();
        slots.sort_unstable_by_key(|(id, _)| *id);
        slots
    }

    /// Ids of all slots owned by a log
    pub fn in_use(&self) -> Vec<u32> {
        self.slots
            .read()
            .iter()
            .filter(|slot| slot.info.in_use)
            .map(|slot| slot.info.id)
            .collect()
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Bytes of one slot on the device
    pub fn slot_size(&self) -> usize {
        self.layout.slot_size(self.sector_size)
    }

    /// Sectors of one slot on the device
    pub fn slot_sectors(&self) -> u64 {
        (self.slot_size() / self.sector_size as usize) as u64
    }

    /// First LBA of a slot (segment 0 starts at LBA 0)
    pub fn slot_lba(&self, id: u32) -> u64 {
        id as u64 * self.slot_sectors()
    }
}
