//! Submission queues and their worker threads
//!
//! Two independent FIFO queues:
//! - data/log-entry queue, drained by `io_threads` workers sharing it
//! - metadata queue, drained by one worker
//!
//! Every worker owns one hardware queue pair. It submits requests in the
//! order it pulls them, and polls its queue pair for completions whenever
//! it has nothing new to submit. Completion callbacks run on the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use crate::config::Config;
use crate::device::{BlockDevice, DeviceError, IoCommand, QueuePair, SubmitError};
use crate::error::{NvlogError, Result};
use crate::space::Span;

use super::completion::{promise, Completion, SubRequestTracker};

enum WorkerMsg {
    Io(IoCommand),
    Shutdown,
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Default)]
struct QueueCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    queue_full_stalls: AtomicU64,
}

impl QueueCounters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            queue_full_stalls: self.queue_full_stalls.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one submission queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Commands accepted by a hardware queue pair
    pub submitted: u64,
    /// Commands whose completion callback ran
    pub completed: u64,
    /// Commands the device refused outright
    pub rejected: u64,
    /// Times a worker found its hardware queue pair full
    pub queue_full_stalls: u64,
}

/// Counters of both submission queues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub data: QueueStats,
    pub metadata: QueueStats,
}

// =============================================================================
// IoQueues
// =============================================================================

pub struct IoQueues {
    data_tx: Sender<WorkerMsg>,
    metadata_tx: Sender<WorkerMsg>,
    data_workers: usize,
    data_counters: Arc<QueueCounters>,
    metadata_counters: Arc<QueueCounters>,
    sector_size: u32,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoQueues {
    /// Allocate queue pairs and spawn the workers
    ///
    /// Queue pairs are allocated up front so a device that cannot supply
    /// them fails here rather than inside a thread.
    pub fn start(device: &dyn BlockDevice, config: &Config) -> Result<Self> {
        let (data_tx, data_rx) = channel::unbounded();
        let (metadata_tx, metadata_rx) = channel::unbounded();
        let data_counters = Arc::new(QueueCounters::default());
        let metadata_counters = Arc::new(QueueCounters::default());
        let batch = config.completion_batch.max(1);

        let mut qpairs = Vec::with_capacity(config.io_threads + 1);
        for _ in 0..config.io_threads.max(1) {
            qpairs.push(device.alloc_queue_pair(config.queue_depth)?);
        }
        let metadata_qpair = device.alloc_queue_pair(config.queue_depth)?;

        let mut workers = Vec::with_capacity(qpairs.len() + 1);
        for (i, qpair) in qpairs.into_iter().enumerate() {
            let worker = Worker {
                name: format!("nvlog-io-{}", i),
                rx: data_rx.clone(),
                qpair,
                counters: Arc::clone(&data_counters),
                batch,
            };
            workers.push(worker.spawn()?);
        }
        let data_workers = workers.len();

        let worker = Worker {
            name: "nvlog-metadata".to_string(),
            rx: metadata_rx,
            qpair: metadata_qpair,
            counters: Arc::clone(&metadata_counters),
            batch,
        };
        workers.push(worker.spawn()?);

        tracing::info!(
            "Started {} data/log I/O worker(s) and 1 metadata worker (queue depth {})",
            data_workers,
            config.queue_depth
        );

        Ok(Self {
            data_tx,
            metadata_tx,
            data_workers,
            data_counters,
            metadata_counters,
            sector_size: device.geometry().sector_size,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a data or log-entry command
    pub fn submit_data(&self, cmd: IoCommand) {
        Self::send(&self.data_tx, cmd);
    }

    /// Queue a metadata command
    pub fn submit_metadata(&self, cmd: IoCommand) {
        Self::send(&self.metadata_tx, cmd);
    }

    fn send(tx: &Sender<WorkerMsg>, cmd: IoCommand) {
        if let Err(channel::SendError(msg)) = tx.send(WorkerMsg::Io(cmd)) {
            // Workers are gone; fail the command so its tracker still resolves
            if let WorkerMsg::Io(cmd) = msg {
                let lba = cmd.lba;
                cmd.complete(Err(DeviceError::Aborted { lba }));
            }
        }
    }

    /// Read physical runs through the data queue into one contiguous buffer
    pub fn read_spans(&self, spans: &[Span]) -> Completion<BytesMut> {
        let (promise, completion) = promise();
        let total: usize = spans.iter().map(|span| span.len).sum();
        let result = Arc::new(Mutex::new(BytesMut::zeroed(total)));

        let assembled = Arc::clone(&result);
        let tracker = SubRequestTracker::new(spans.len(), move |status| {
            let outcome = status
                .map(|()| std::mem::take(&mut *assembled.lock()))
                .map_err(NvlogError::from);
            promise.fulfill(outcome);
        });

        for span in spans {
            let tracker = Arc::clone(&tracker);
            let result = Arc::clone(&result);
            let span = *span;
            let cmd = IoCommand::read(
                span.lba,
                span.sectors,
                self.sector_size,
                Box::new(move |done| {
                    if done.status.is_ok() {
                        let data = done.buffer.into_read();
                        result.lock()[span.buf_offset..span.buf_offset + span.len]
                            .copy_from_slice(&data[..span.len]);
                    }
                    tracker.complete(done.status);
                }),
            );
            self.submit_data(cmd);
        }
        completion
    }

    pub fn stats(&self) -> IoStats {
        IoStats {
            data: self.data_counters.snapshot(),
            metadata: self.metadata_counters.snapshot(),
        }
    }

    /// Stop every worker after it has reaped all its outstanding commands
    ///
    /// Callers must make sure nothing new is queued (no operation in flight)
    /// before calling this. Fails if any worker panicked.
    pub fn shutdown(&self) -> Result<()> {
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return Ok(());
        }
        for _ in 0..self.data_workers {
            let _ = self.data_tx.send(WorkerMsg::Shutdown);
        }
        let _ = self.metadata_tx.send(WorkerMsg::Shutdown);

        let mut panicked = Vec::new();
        for handle in workers {
            let name = handle.thread().name().unwrap_or("nvlog-worker").to_string();
            if handle.join().is_err() {
                tracing::error!("I/O worker {} panicked", name);
                panicked.push(name);
            }
        }
        if !panicked.is_empty() {
            return Err(NvlogError::WorkerPanicked(panicked.join(", ")));
        }
        tracing::info!("I/O workers stopped");
        Ok(())
    }
}

impl Drop for IoQueues {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    name: String,
    rx: Receiver<WorkerMsg>,
    qpair: Box<dyn QueuePair>,
    counters: Arc<QueueCounters>,
    batch: usize,
}

impl Worker {
    fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    fn run(mut self) {
        tracing::debug!("{} started", self.name);
        let mut draining = false;

        loop {
            if !draining {
                draining = self.pull();
            }

            let reaped = self.qpair.process_completions(self.batch);
            self.counters
                .completed
                .fetch_add(reaped as u64, Ordering::Relaxed);

            if draining && self.qpair.outstanding() == 0 {
                break;
            }
        }
        tracing::debug!("{} stopped", self.name);
    }

    /// Submit up to one batch of queued requests, in queue order.
    /// Returns true once a shutdown request (or disconnect) is seen.
    fn pull(&mut self) -> bool {
        for pulled in 0..self.batch {
            let msg = if pulled == 0 && self.qpair.outstanding() == 0 {
                // Nothing in flight: park on the queue
                match self.rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => return true,
                }
            } else {
                match self.rx.try_recv() {
                    Ok(msg) => msg,
                    Err(TryRecvError::Empty) => return false,
                    Err(TryRecvError::Disconnected) => return true,
                }
            };

            match msg {
                WorkerMsg::Io(cmd) => self.submit(cmd),
                WorkerMsg::Shutdown => return true,
            }
        }
        false
    }

    /// Hand a command to the queue pair, stalling while it is full
    fn submit(&mut self, mut cmd: IoCommand) {
        let backoff = Backoff::new();
        let lba = cmd.lba;
        loop {
            match self.qpair.submit(cmd) {
                Ok(()) => {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("{} submitted LBA {}", self.name, lba);
                    return;
                }
                Err(SubmitError::QueueFull(returned)) => {
                    cmd = returned;
                    self.counters
                        .queue_full_stalls
                        .fetch_add(1, Ordering::Relaxed);
                    let reaped = self.qpair.process_completions(self.batch);
                    self.counters
                        .completed
                        .fetch_add(reaped as u64, Ordering::Relaxed);
                    if reaped == 0 {
                        backoff.snooze();
                    }
                }
                Err(SubmitError::Rejected(returned, e)) => {
                    tracing::warn!("{} rejected command at LBA {}: {}", self.name, returned.lba, e);
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    returned.complete(Err(e));
                    return;
                }
            }
        }
    }
}
