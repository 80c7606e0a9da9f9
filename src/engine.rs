//! Engine Module
//!
//! The storage engine handle that wires all components to one device.
//!
//! ## Responsibilities
//! - Bootstrap: read the metadata array from segment 0, rebuild the
//!   allocation bitset and the working translation tables, quarantine
//!   slots that cannot be trusted
//! - Load logs by name (slot lookup or assignment)
//! - Route appends and metadata updates to the write coordinator
//! - Serve blocking reads of log entries, payloads and raw sectors
//! - Drain in-flight operations before releasing the queue pairs

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::{Config, Layout};
use crate::coordinator::AtomicWriteCoordinator;
use crate::device::{BlockDevice, ControllerInfo, DeviceError, DeviceProbe, Geometry};
use crate::error::{NvlogError, Result};
use crate::io::{Completion, InflightOps, IoQueues, IoStats};
use crate::metadata::{AddressTable, LogEntry, LogInfo, LogMetadataSlot, MetadataStore, LOG_ENTRY_SIZE};
use crate::space::{AddressSpace, AddressTranslator, SegmentAllocator, Span};

/// Caller-visible state of a loaded log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMetadataView {
    /// Last persisted info of the log
    pub info: LogInfo,
    /// Entry at `tail - 1`, if the log has ever been appended to
    pub last_entry: Option<LogEntry>,
    next_data_offset: u64,
}

impl LogMetadataView {
    pub fn id(&self) -> u32 {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn head(&self) -> i64 {
        self.info.head
    }

    pub fn tail(&self) -> i64 {
        self.info.tail
    }

    pub fn version(&self) -> i64 {
        self.info.version
    }

    /// Log-entry space offset of the next append
    pub fn next_entry_offset(&self) -> u64 {
        self.info.tail.max(0) as u64 * LOG_ENTRY_SIZE as u64
    }

    /// First sector-aligned data space offset past the last payload
    pub fn next_data_offset(&self) -> u64 {
        self.next_data_offset
    }
}

/// The nvlog storage engine
///
/// ## Concurrency Model
///
/// - **Writes** (append/update_metadata): one in flight per log, any
///   number of logs in parallel. Callers block on a `Completion` until the
///   metadata write is durable.
/// - **Reads**: lock-free apart from the translation-table lookup; safe
///   against writes to other logs and to committed regions of the same log.
/// - **Load**: serialized by `load_lock`; runs once per log per process.
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Geometry reported by the attached namespace
    geometry: Geometry,

    /// Submission queues and their workers
    queues: Arc<IoQueues>,

    /// Persisted metadata image and name → slot map
    store: Arc<MetadataStore>,

    /// Working translation tables
    translator: Arc<AddressTranslator>,

    /// Append / metadata-update sequencing
    coordinator: AtomicWriteCoordinator,

    /// Operations not yet resolved; drained on close
    inflight: Arc<InflightOps>,

    /// Serializes the load path
    load_lock: Mutex<()>,
}

impl Engine {
    /// Open an engine on an attached device
    ///
    /// On startup:
    /// 1. Validate the layout against the device geometry
    /// 2. Start the I/O workers
    /// 3. Read the metadata array from segment 0
    /// 4. Rebuild the segment bitset from every persisted table
    /// 5. Ready to serve requests
    ///
    /// Slots that fail their checksum or clash with another slot are
    /// quarantined rather than failing the open; see [`Engine::quarantined`].
    pub fn open(config: Config, device: Arc<dyn BlockDevice>) -> Result<Self> {
        // Step 1: Check the layout fits this device
        let geometry = device.geometry();
        let layout = config.layout;
        layout.validate(&geometry)?;

        // Step 2: Queue pairs and workers
        let queues = Arc::new(IoQueues::start(device.as_ref(), &config)?);

        // Step 3: Persisted metadata image
        let metadata_sectors = layout.metadata_bytes(geometry.sector_size) / geometry.sector_size as u64;
        let image = queues
            .read_spans(&physical_spans(&geometry, 0, metadata_sectors))
            .wait()?;
        let store = Arc::new(MetadataStore::from_image(layout, geometry.sector_size, &image)?);

        // Step 4: Segment bitset and working tables
        let total_segments = (geometry.capacity_bytes() >> layout.segment_bits) as usize;
        let allocator = Arc::new(SegmentAllocator::new(total_segments));
        let tables = Self::claim_segments(&layout, &store, &allocator)?;
        let translator = Arc::new(AddressTranslator::new(
            layout,
            geometry,
            Arc::clone(&allocator),
            tables,
        ));

        let inflight = Arc::new(InflightOps::default());
        let coordinator = AtomicWriteCoordinator::new(
            layout,
            geometry,
            Arc::clone(&queues),
            Arc::clone(&store),
            Arc::clone(&translator),
            Arc::clone(&inflight),
        )?;

        tracing::info!(
            "Engine open: {} log(s) on device, {}/{} segments in use (segment size {} bytes)",
            store.in_use().len(),
            allocator.used(),
            allocator.total(),
            layout.segment_size()
        );

        Ok(Self {
            config,
            geometry,
            queues,
            store,
            translator,
            coordinator,
            inflight,
            load_lock: Mutex::new(()),
        })
    }

    /// Run probe/attach over discovered controllers and open the accepted one
    pub fn attach<I>(config: Config, candidates: I) -> Result<Self>
    where
        I: IntoIterator<Item = (ControllerInfo, Arc<dyn BlockDevice>)>,
    {
        let mut probe = DeviceProbe::new(config.transport_filter.clone());
        probe.run(candidates);
        let device = probe.into_device()?;
        Self::open(config, device)
    }

    /// Mark every segment named by a persisted table as used
    ///
    /// A slot whose tables point at reserved, out-of-range or already
    /// claimed segments is quarantined. Quarantined slots still reserve
    /// whatever segments they name that nobody else holds.
    fn claim_segments(
        layout: &Layout,
        store: &MetadataStore,
        allocator: &SegmentAllocator,
    ) -> Result<Vec<AddressTable>> {
        let mut tables = Vec::with_capacity(layout.max_logs);
        for id in 0..layout.max_logs as u32 {
            let slot = store.read_slot(id)?;
            if slot.info.in_use {
                let clashes: Vec<u16> = slot
                    .table
                    .mapped_segments()
                    .filter(|&segment| !allocator.mark_used(segment))
                    .collect();
                if clashes.is_empty() {
                    tracing::debug!(
                        "Bootstrapped log '{}' (id {}): head={} tail={} version={}",
                        slot.info.name,
                        id,
                        slot.info.head,
                        slot.info.tail,
                        slot.info.version
                    );
                } else {
                    store.quarantine(
                        id,
                        format!(
                            "segment(s) {:?} are reserved, out of range or mapped twice",
                            clashes
                        ),
                    );
                }
            } else if store.is_quarantined(id) {
                let reserved = slot
                    .table
                    .mapped_segments()
                    .filter(|&segment| allocator.mark_used(segment))
                    .count();
                tracing::debug!("Quarantined slot {} keeps {} segment(s)", id, reserved);
            }
            tables.push(slot.table);
        }
        Ok(tables)
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Return the persisted state of a named log, creating it if needed
    ///
    /// A newly assigned slot is persisted before this returns; if that
    /// write fails the assignment is undone.
    pub fn load(&self, name: &str) -> Result<LogMetadataView> {
        let _load_guard = self.load_lock.lock();

        let (id, fresh) = self.store.assign_slot(name)?;
        if fresh {
            let slot = LogMetadataSlot::fresh(&self.config.layout, id, name);
            let persisted = self
                .coordinator
                .persist_fresh(slot)
                .and_then(|completion| completion.wait());
            if let Err(e) = persisted {
                tracing::warn!("Failed to persist new log '{}' in slot {}: {}", name, id, e);
                self.store.release(name);
                return Err(e);
            }
            tracing::info!("Created log '{}' (id {})", name, id);
        }

        let info = self.store.read_info(id)?;
        let last_entry = if info.tail > 0 {
            Some(self.fetch_entry(id, info.tail - 1)?)
        } else {
            None
        };
        let next_data_offset = self.resume_data_offset(&info, last_entry)?;

        if !self.coordinator.is_loaded(id) {
            self.coordinator.mark_loaded(id)?;
            tracing::debug!(
                "Loaded log '{}' (id {}): head={} tail={} version={}",
                name,
                id,
                info.head,
                info.tail,
                info.version
            );
        }

        Ok(LogMetadataView {
            info,
            last_entry,
            next_data_offset,
        })
    }

    /// Sector-aligned end of the furthest payload among the trailing entries
    ///
    /// Walks back over empty entries to the last one that carries a payload,
    /// so an empty entry at an arbitrary offset cannot pull the offset back.
    fn resume_data_offset(&self, info: &LogInfo, last_entry: Option<LogEntry>) -> Result<u64> {
        let mut end = 0;
        let mut index = info.tail - 1;
        let mut entry = last_entry;
        while let Some(current) = entry {
            end = end.max(current.data_end());
            if current.data_length > 0 || index <= info.head {
                break;
            }
            index -= 1;
            entry = Some(self.fetch_entry(info.id, index)?);
        }
        Ok(self.geometry.round_up(end))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append one record and advance the log's metadata to `snapshot`
    ///
    /// Blocks until the metadata write is durable or the operation failed.
    /// `snapshot` must carry the new tail and a version above the committed one.
    pub fn append(
        &self,
        id: u32,
        data: &[u8],
        entry: &LogEntry,
        log_offset: u64,
        snapshot: &LogInfo,
    ) -> Result<()> {
        self.append_async(
            id,
            Bytes::copy_from_slice(data),
            *entry,
            log_offset,
            snapshot.clone(),
        )?
        .wait()
    }

    /// Start an append; the returned handle resolves when it is durable
    ///
    /// Dropping the handle does not cancel the append. A second operation
    /// on the same log blocks in this call until the first one resolves.
    pub fn append_async(
        &self,
        id: u32,
        data: Bytes,
        entry: LogEntry,
        log_offset: u64,
        snapshot: LogInfo,
    ) -> Result<Completion<()>> {
        self.coordinator.append(id, data, entry, log_offset, snapshot)
    }

    /// Persist a metadata snapshot without payload (head/tail trimming)
    pub fn update_metadata(&self, id: u32, snapshot: &LogInfo) -> Result<()> {
        self.update_metadata_async(id, snapshot.clone())?.wait()
    }

    pub fn update_metadata_async(&self, id: u32, snapshot: LogInfo) -> Result<Completion<()>> {
        self.coordinator.update_metadata(id, snapshot)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the committed log entry at `index`
    pub fn read_entry(&self, id: u32, index: i64) -> Result<LogEntry> {
        self.check_committed(id, index)?;
        self.fetch_entry(id, index)
    }

    /// Read the payload of the committed log entry at `index`
    pub fn read_data(&self, id: u32, index: i64) -> Result<Bytes> {
        let entry = self.read_entry(id, index)?;
        if entry.data_length == 0 {
            return Ok(Bytes::new());
        }

        let _guard = self.inflight.enter()?;
        let padded = self.geometry.round_up(entry.data_length);
        let spans = self
            .translator
            .spans(id, AddressSpace::Data, entry.data_offset, padded, false)?;
        let mut buf = self.queues.read_spans(&spans).wait()?;
        buf.truncate(entry.data_length as usize);
        Ok(buf.freeze())
    }

    /// Read raw device sectors
    pub fn read_sectors(&self, lba: u64, count: u64) -> Result<Bytes> {
        let capacity = self.geometry.capacity_sectors;
        if count == 0 || lba.checked_add(count).map_or(true, |end| end > capacity) {
            return Err(DeviceError::OutOfRange {
                lba,
                count: count.min(u32::MAX as u64) as u32,
                capacity,
            }
            .into());
        }

        let _guard = self.inflight.enter()?;
        let spans = physical_spans(&self.geometry, lba, count);
        Ok(self.queues.read_spans(&spans).wait()?.freeze())
    }

    fn check_committed(&self, id: u32, index: i64) -> Result<()> {
        let info = self.store.read_info(id)?;
        if !info.in_use || index < info.head || index >= info.tail {
            return Err(NvlogError::IndexOutOfRange {
                log_id: id,
                index,
                head: info.head,
                tail: info.tail,
            });
        }
        Ok(())
    }

    /// Read the entry at `index` without the committed-range check
    fn fetch_entry(&self, id: u32, index: i64) -> Result<LogEntry> {
        let _guard = self.inflight.enter()?;
        let sector = self.geometry.sector_size as u64;
        let offset = index as u64 * LOG_ENTRY_SIZE as u64;
        let sector_offset = offset / sector * sector;

        let spans = self
            .translator
            .spans(id, AddressSpace::LogEntry, sector_offset, sector, false)?;
        let image = self.queues.read_spans(&spans).wait()?;
        LogEntry::decode(&image[(offset - sector_offset) as usize..])
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Wait for in-flight operations, then stop the I/O workers
    ///
    /// Reports a worker that panicked while the engine was running.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.inflight.is_closing() {
            return Ok(());
        }
        tracing::info!(
            "Shutting down: waiting for {} in-flight operation(s)",
            self.inflight.count()
        );
        self.inflight.close_and_drain();
        self.queues.shutdown()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Last persisted info of a log
    pub fn metadata(&self, id: u32) -> Result<LogInfo> {
        self.store.read_info(id)
    }

    /// Persisted info of every log on the device
    pub fn logs(&self) -> Vec<LogInfo> {
        self.store
            .in_use()
            .into_iter()
            .filter_map(|id| self.store.read_info(id).ok())
            .collect()
    }

    /// Metadata slots taken out of service at bootstrap, with the reason
    pub fn quarantined(&self) -> Vec<(u32, String)> {
        self.store.quarantined()
    }

    /// Slot id of a log, without creating it
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.store.lookup(name)
    }

    /// Highest version whose metadata write completed in this process
    pub fn last_written_version(&self, id: u32) -> Result<i64> {
        self.coordinator.last_written_version(id)
    }

    pub fn io_stats(&self) -> IoStats {
        self.queues.stats()
    }

    pub fn segments_used(&self) -> usize {
        self.translator.allocator().used()
    }

    pub fn segments_free(&self) -> usize {
        self.translator.allocator().free()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Engine shutdown failed: {}", e);
        }
    }
}

/// Split a physical sector range at the device's transfer limit
fn physical_spans(geometry: &Geometry, lba: u64, count: u64) -> Vec<Span> {
    let sector = geometry.sector_size as usize;
    let max = geometry.max_sectors_per_io.max(1) as u64;
    let mut spans = Vec::new();
    let mut done = 0u64;
    while done < count {
        let run = (count - done).min(max);
        spans.push(Span {
            lba: lba + done,
            sectors: run as u32,
            buf_offset: done as usize * sector,
            len: run as usize * sector,
        });
        done += run;
    }
    spans
}
