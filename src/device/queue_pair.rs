//! Polled queue pair
//!
//! Queue pair shared by the RAM and file backends. Commands sit in the
//! submission ring until the owning thread polls; the poll executes them
//! against the medium and invokes the callbacks.

use std::collections::VecDeque;
use std::sync::Arc;

use super::{DeviceError, Geometry, IoBuffer, IoCommand, QueuePair, SubmitError};

/// Order in which a poll retires queued commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionOrder {
    /// Oldest command first
    #[default]
    Fifo,
    /// Newest command first, to exercise out-of-order completion handling
    Reversed,
}

/// Storage behind a polled queue pair
pub(crate) trait Medium: Send + Sync + 'static {
    fn read_at(&self, lba: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    fn write_at(&self, lba: u64, buf: &[u8]) -> Result<(), DeviceError>;

    /// Make completed writes durable before their callbacks run
    fn flush(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

pub(crate) struct PolledQueuePair<M: Medium> {
    medium: Arc<M>,
    geometry: Geometry,
    depth: usize,
    order: CompletionOrder,
    ring: VecDeque<IoCommand>,
}

impl<M: Medium> PolledQueuePair<M> {
    pub(crate) fn new(medium: Arc<M>, geometry: Geometry, depth: u32, order: CompletionOrder) -> Self {
        Self {
            medium,
            geometry,
            depth: depth.max(1) as usize,
            order,
            ring: VecDeque::new(),
        }
    }

    fn check(&self, cmd: &IoCommand) -> Result<(), DeviceError> {
        let end = cmd.lba.checked_add(cmd.sector_count as u64);
        if end.map_or(true, |end| end > self.geometry.capacity_sectors) {
            return Err(DeviceError::OutOfRange {
                lba: cmd.lba,
                count: cmd.sector_count,
                capacity: self.geometry.capacity_sectors,
            });
        }
        let expected = cmd.sector_count as usize * self.geometry.sector_size as usize;
        if cmd.sector_count == 0
            || cmd.sector_count > self.geometry.max_sectors_per_io
            || cmd.buffer.len() != expected
        {
            return Err(DeviceError::BadBuffer {
                len: cmd.buffer.len(),
                count: cmd.sector_count,
            });
        }
        Ok(())
    }

    fn execute(&self, cmd: &mut IoCommand) -> Result<(), DeviceError> {
        match &mut cmd.buffer {
            IoBuffer::Read(buf) => self.medium.read_at(cmd.lba, &mut buf[..]),
            IoBuffer::Write(buf) => self.medium.write_at(cmd.lba, &buf[..]),
        }
    }
}

impl<M: Medium> QueuePair for PolledQueuePair<M> {
    fn submit(&mut self, cmd: IoCommand) -> Result<(), SubmitError> {
        if let Err(e) = self.check(&cmd) {
            return Err(SubmitError::Rejected(cmd, e));
        }
        if self.ring.len() >= self.depth {
            return Err(SubmitError::QueueFull(cmd));
        }
        self.ring.push_back(cmd);
        Ok(())
    }

    fn process_completions(&mut self, max: usize) -> usize {
        let count = max.min(self.ring.len());
        if count == 0 {
            return 0;
        }

        let mut finished = Vec::with_capacity(count);
        for _ in 0..count {
            let next = match self.order {
                CompletionOrder::Fifo => self.ring.pop_front(),
                CompletionOrder::Reversed => self.ring.pop_back(),
            };
            let Some(mut cmd) = next else { break };
            let status = self.execute(&mut cmd);
            finished.push((cmd, status));
        }

        // Writes are only reported once the medium says they are durable
        let wrote = finished.iter().any(|(cmd, status)| cmd.is_write() && status.is_ok());
        let flush_status = if wrote { self.medium.flush() } else { Ok(()) };

        let completed = finished.len();
        for (cmd, status) in finished {
            let status = match (&status, &flush_status) {
                (Ok(()), Err(e)) if cmd.is_write() => Err(e.clone()),
                _ => status,
            };
            cmd.complete(status);
        }
        completed
    }

    fn outstanding(&self) -> usize {
        self.ring.len()
    }
}
