//! Atomic Write Coordinator
//!
//! Makes an append of (payload, log entry, metadata) crash-safe without
//! multi-block device transactions.
//!
//! ## Protocol
//! ```text
//!  1. take the log's processing permit
//!  2. payload + entry-sector writes ──► data queue      (N sub-requests)
//!  3. last of the N completions      ──► metadata queue (table sectors)
//!  4. table sectors complete         ──► metadata queue (info record)
//!  5. info record completes          ──► commit in-memory image,
//!                                        advance last_written_version,
//!                                        release permit, wake caller
//! ```
//!
//! The slot (address tables + info) is only written after everything it
//! refers to is on the device, and the info record only after the tables.
//! A crash before step 5 leaves the previous record in place, so recovery
//! never sees a tail or version that points at partially written payload.
//! Tables written ahead of a lost record only add mappings. A failed
//! sub-request skips every later step.

mod log_state;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::config::Layout;
use crate::device::{Geometry, IoCommand};
use crate::error::{NvlogError, Result};
use crate::io::{promise, Completion, InflightGuard, InflightOps, IoQueues, Promise, SubRequestTracker};
use crate::metadata::{LogEntry, LogInfo, LogMetadataSlot, MetadataStore, LOG_ENTRY_SIZE};
use crate::space::{AddressSpace, AddressTranslator};

use log_state::{EntrySector, LogWriteState, Permit};

struct Inner {
    layout: Layout,
    geometry: Geometry,
    queues: Arc<IoQueues>,
    store: Arc<MetadataStore>,
    translator: Arc<AddressTranslator>,
    inflight: Arc<InflightOps>,
    logs: Vec<LogWriteState>,
    /// Highest version whose metadata write has completed, per log
    last_written: Vec<AtomicI64>,
}

#[derive(Clone)]
pub(crate) struct AtomicWriteCoordinator {
    inner: Arc<Inner>,
}

impl AtomicWriteCoordinator {
    pub(crate) fn new(
        layout: Layout,
        geometry: Geometry,
        queues: Arc<IoQueues>,
        store: Arc<MetadataStore>,
        translator: Arc<AddressTranslator>,
        inflight: Arc<InflightOps>,
    ) -> Result<Self> {
        let mut last_written = Vec::with_capacity(layout.max_logs);
        for id in 0..layout.max_logs as u32 {
            last_written.push(AtomicI64::new(store.read_info(id)?.version));
        }
        let logs = (0..layout.max_logs).map(|_| LogWriteState::new()).collect();

        Ok(Self {
            inner: Arc::new(Inner {
                layout,
                geometry,
                queues,
                store,
                translator,
                inflight,
                logs,
                last_written,
            }),
        })
    }

    // =========================================================================
    // Log State
    // =========================================================================

    fn state(&self, id: u32) -> Result<&LogWriteState> {
        self.inner
            .logs
            .get(id as usize)
            .ok_or(NvlogError::UnknownLog(id))
    }

    fn loaded_state(&self, id: u32) -> Result<&LogWriteState> {
        let state = self.state(id)?;
        if !state.is_loaded() {
            return Err(NvlogError::UnknownLog(id));
        }
        Ok(state)
    }

    pub(crate) fn mark_loaded(&self, id: u32) -> Result<()> {
        self.state(id)?.mark_loaded();
        Ok(())
    }

    pub(crate) fn is_loaded(&self, id: u32) -> bool {
        self.state(id).map(|s| s.is_loaded()).unwrap_or(false)
    }

    pub(crate) fn last_written_version(&self, id: u32) -> Result<i64> {
        self.inner
            .last_written
            .get(id as usize)
            .map(|v| v.load(Ordering::Acquire))
            .ok_or(NvlogError::UnknownLog(id))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Persist a newly assigned slot
    pub(crate) fn persist_fresh(&self, slot: LogMetadataSlot) -> Result<Completion<()>> {
        let guard = self.inner.inflight.enter()?;
        let permit = self.state(slot.info.id)?.acquire()?;
        let (promise, completion) = promise();
        self.write_metadata(slot, permit, guard, promise)?;
        Ok(completion)
    }

    /// Write payload and log entry, then the metadata snapshot that claims them
    pub(crate) fn append(
        &self,
        id: u32,
        data: Bytes,
        entry: LogEntry,
        log_offset: u64,
        snapshot: LogInfo,
    ) -> Result<Completion<()>> {
        let guard = self.inner.inflight.enter()?;
        let state = self.loaded_state(id)?;
        let sector_size = self.inner.geometry.sector_size;

        if log_offset % LOG_ENTRY_SIZE as u64 != 0 {
            return Err(NvlogError::Misaligned {
                what: "log entry offset",
                value: log_offset,
                alignment: LOG_ENTRY_SIZE as u64,
            });
        }
        if !self.inner.geometry.is_aligned(entry.data_offset) {
            return Err(NvlogError::Misaligned {
                what: "data offset",
                value: entry.data_offset,
                alignment: sector_size as u64,
            });
        }
        if data.len() as u64 != entry.data_length {
            return Err(NvlogError::InvalidArgument(format!(
                "payload is {} bytes but the log entry says {}",
                data.len(),
                entry.data_length
            )));
        }
        let index = (log_offset / LOG_ENTRY_SIZE as u64) as i64;
        if index >= snapshot.tail {
            return Err(NvlogError::InvalidArgument(format!(
                "entry index {} is not covered by the new tail {}",
                index, snapshot.tail
            )));
        }

        let permit = state.acquire()?;
        let committed = self.inner.store.read_info(id)?;
        Self::validate(id, &committed, &snapshot, true)?;

        // Entry sector first: it also rejects a log-entry space overflow
        // before any data segment gets allocated
        let (sector_offset, image) = self.stage_entry(state, id, log_offset, &entry)?;
        let translator = &self.inner.translator;
        let mut writes: Vec<(u64, Bytes)> = Vec::new();
        for span in translator.spans(id, AddressSpace::LogEntry, sector_offset, sector_size as u64, true)? {
            writes.push((span.lba, image.slice(span.buf_offset..span.buf_offset + span.len)));
        }
        if !data.is_empty() {
            let padded = pad_to_sectors(data, sector_size);
            for span in translator.spans(id, AddressSpace::Data, entry.data_offset, padded.len() as u64, true)? {
                writes.push((span.lba, padded.slice(span.buf_offset..span.buf_offset + span.len)));
            }
        }

        let slot = LogMetadataSlot {
            table: translator.snapshot(id)?,
            info: snapshot,
        };
        tracing::debug!(
            "Log {} append v{} at entry {}: {} sub-request(s)",
            id,
            slot.info.version,
            index,
            writes.len()
        );

        let (promise, completion) = promise();
        let coordinator = self.clone();
        let tracker = SubRequestTracker::new(writes.len(), move |status| match status {
            Ok(()) => {
                if let Err(e) = coordinator.write_metadata(slot, permit, guard, promise) {
                    tracing::error!("Log {} could not stage metadata write: {}", id, e);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Log {} append v{} failed, metadata not advanced: {}",
                    id,
                    slot.info.version,
                    e
                );
                drop(permit);
                promise.fulfill(Err(e.into()));
                drop(guard);
            }
        });

        for (lba, buf) in writes {
            let tracker = Arc::clone(&tracker);
            self.inner.queues.submit_data(IoCommand::write(
                lba,
                buf,
                sector_size,
                Box::new(move |done| tracker.complete(done.status)),
            ));
        }
        Ok(completion)
    }

    /// Write a metadata snapshot with no payload behind it
    pub(crate) fn update_metadata(&self, id: u32, snapshot: LogInfo) -> Result<Completion<()>> {
        let guard = self.inner.inflight.enter()?;
        let state = self.loaded_state(id)?;
        let permit = state.acquire()?;
        let committed = self.inner.store.read_info(id)?;
        Self::validate(id, &committed, &snapshot, false)?;

        let slot = LogMetadataSlot {
            table: self.inner.translator.snapshot(id)?,
            info: snapshot,
        };
        tracing::debug!(
            "Log {} metadata update v{} head={} tail={}",
            id,
            slot.info.version,
            slot.info.head,
            slot.info.tail
        );

        let (promise, completion) = promise();
        self.write_metadata(slot, permit, guard, promise)?;
        Ok(completion)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn validate(id: u32, committed: &LogInfo, snapshot: &LogInfo, strict: bool) -> Result<()> {
        if snapshot.id != id || snapshot.name != committed.name || !snapshot.in_use {
            return Err(NvlogError::InvalidArgument(format!(
                "snapshot for '{}' (id {}) does not describe log '{}' (id {})",
                snapshot.name, snapshot.id, committed.name, id
            )));
        }
        if snapshot.head < 0 || snapshot.head > snapshot.tail {
            return Err(NvlogError::InvalidArgument(format!(
                "head {} / tail {} out of order",
                snapshot.head, snapshot.tail
            )));
        }
        let stale = if strict {
            snapshot.version <= committed.version
        } else {
            snapshot.version < committed.version
        };
        if stale {
            return Err(NvlogError::StaleVersion {
                log_id: id,
                requested: snapshot.version,
                committed: committed.version,
            });
        }
        Ok(())
    }

    /// Put `entry` into the image of its sector and return a copy to write
    fn stage_entry(
        &self,
        state: &LogWriteState,
        id: u32,
        log_offset: u64,
        entry: &LogEntry,
    ) -> Result<(u64, Bytes)> {
        let sector = self.inner.geometry.sector_size as u64;
        let sector_offset = log_offset / sector * sector;

        let mut cached = state.entry_sector.lock();
        let mut image = match cached.take() {
            Some(current) if current.offset == sector_offset => current.image,
            _ => self.read_entry_sector(id, sector_offset)?,
        };
        entry.encode_into(&mut image[(log_offset - sector_offset) as usize..]);

        let out = Bytes::copy_from_slice(&image);
        *cached = Some(EntrySector {
            offset: sector_offset,
            image,
        });
        Ok((sector_offset, out))
    }

    fn read_entry_sector(&self, id: u32, sector_offset: u64) -> Result<BytesMut> {
        let sector = self.inner.geometry.sector_size as u64;
        match self
            .inner
            .translator
            .spans(id, AddressSpace::LogEntry, sector_offset, sector, false)
        {
            Ok(spans) => self.inner.queues.read_spans(&spans).wait(),
            Err(NvlogError::SegmentUnmapped { .. }) => Ok(BytesMut::zeroed(sector as usize)),
            Err(e) => Err(e),
        }
    }

    /// Queue the slot write; completion commits it and releases the permit
    ///
    /// Table sectors outside the info record go first. The record sectors
    /// follow as one command once those are durable, so a failure in either
    /// phase leaves the previous record, and with it the previous tail and
    /// version, on the device.
    fn write_metadata(
        &self,
        slot: LogMetadataSlot,
        permit: Permit,
        guard: InflightGuard,
        promise: Promise<()>,
    ) -> Result<()> {
        let inner = &self.inner;
        let sector_size = inner.geometry.sector_size;
        let image = match slot.encode(&inner.layout, sector_size) {
            Ok(image) => Bytes::from(image),
            Err(e) => {
                drop(permit);
                promise.fulfill(Err(NvlogError::InvalidArgument(e.to_string())));
                drop(guard);
                return Err(e);
            }
        };

        let sector = sector_size as usize;
        let max_io = (inner.geometry.max_sectors_per_io as u64).max(1);
        let base = inner.store.slot_lba(slot.info.id);
        let record = inner.layout.info_record_sectors(sector_size);

        let mut tables = Vec::new();
        let mut at = 0;
        while at < record.start {
            let end = (at + max_io).min(record.start);
            tables.push((base + at, image.slice(at as usize * sector..end as usize * sector)));
            at = end;
        }

        let commit = MetadataCommit {
            inner: Arc::clone(&self.inner),
            lba: base + record.start,
            record: image.slice(record.start as usize * sector..record.end as usize * sector),
            slot,
            permit,
            guard,
            promise,
        };
        let tracker = SubRequestTracker::new(tables.len(), move |status| match status {
            Ok(()) => commit.submit(),
            Err(e) => commit.fail(e.into()),
        });

        for (lba, bytes) in tables {
            let tracker = Arc::clone(&tracker);
            inner.queues.submit_metadata(IoCommand::write(
                lba,
                bytes,
                sector_size,
                Box::new(move |done| tracker.complete(done.status)),
            ));
        }
        Ok(())
    }
}

/// Second phase of a slot write: the info record
struct MetadataCommit {
    inner: Arc<Inner>,
    lba: u64,
    record: Bytes,
    slot: LogMetadataSlot,
    permit: Permit,
    guard: InflightGuard,
    promise: Promise<()>,
}

impl MetadataCommit {
    fn submit(self) {
        let inner = Arc::clone(&self.inner);
        let lba = self.lba;
        let record = self.record.clone();
        let command = IoCommand::write(
            lba,
            record,
            inner.geometry.sector_size,
            Box::new(move |done| match done.status {
                Ok(()) => self.finish(),
                Err(e) => self.fail(e.into()),
            }),
        );
        inner.queues.submit_metadata(command);
    }

    fn finish(self) {
        let Self {
            inner,
            slot,
            permit,
            guard,
            promise,
            ..
        } = self;
        let id = slot.info.id;
        let version = slot.info.version;
        inner.store.commit(slot);
        inner.last_written[id as usize].fetch_max(version, Ordering::AcqRel);
        tracing::debug!("Log {} metadata v{} durable", id, version);
        drop(permit);
        promise.fulfill(Ok(()));
        drop(guard);
    }

    fn fail(self, e: NvlogError) {
        tracing::error!(
            "Log {} metadata write v{} failed: {}",
            self.slot.info.id,
            self.slot.info.version,
            e
        );
        let Self {
            permit,
            guard,
            promise,
            ..
        } = self;
        drop(permit);
        promise.fulfill(Err(e));
        drop(guard);
    }
}

/// Zero-pad a payload to whole sectors
fn pad_to_sectors(data: Bytes, sector_size: u32) -> Bytes {
    let sector = sector_size as usize;
    if data.len() % sector == 0 {
        return data;
    }
    let mut padded = BytesMut::with_capacity(data.len().div_ceil(sector) * sector);
    padded.extend_from_slice(&data);
    padded.resize(data.len().div_ceil(sector) * sector, 0);
    padded.freeze()
}
