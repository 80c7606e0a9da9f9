//! Completion plumbing
//!
//! Bridges asynchronous device completions back to callers:
//! - [`SubRequestTracker`]: outstanding-count for one logical operation
//!   split into several commands. Completion order is arbitrary; the last
//!   one to finish fires the continuation.
//! - [`Promise`] / [`Completion`]: one-shot channel a blocked caller waits on.
//! - [`InflightOps`]: count of logical operations still owned by the
//!   completion path, drained before shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use crate::device::DeviceError;
use crate::error::{NvlogError, Result};

// =============================================================================
// Promise / Completion
// =============================================================================

/// Create a connected promise/completion pair
pub(crate) fn promise<T>() -> (Promise<T>, Completion<T>) {
    let (tx, rx) = channel::bounded(1);
    (Promise { tx }, Completion { rx })
}

/// Producer half, resolved from a completion callback
pub(crate) struct Promise<T> {
    tx: Sender<Result<T>>,
}

impl<T> Promise<T> {
    /// Resolve; a dropped `Completion` (fire-and-forget) is fine
    pub(crate) fn fulfill(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }
}

/// Handle to the outcome of an operation in flight
///
/// Dropping it without waiting leaves the operation running to completion.
#[must_use = "dropping a Completion does not cancel the operation, but its outcome is lost"]
pub struct Completion<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// Block until the operation is durable or failed
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(NvlogError::ShutDown))
    }

    /// Block for at most `timeout`; `None` if still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(NvlogError::ShutDown)),
        }
    }
}

// =============================================================================
// SubRequestTracker
// =============================================================================

type OnDone = Box<dyn FnOnce(std::result::Result<(), DeviceError>) + Send>;

/// Outstanding-count for the commands of one logical operation
pub(crate) struct SubRequestTracker {
    remaining: AtomicUsize,
    first_error: Mutex<Option<DeviceError>>,
    on_done: Mutex<Option<OnDone>>,
}

impl SubRequestTracker {
    /// Track `count` commands; `on_done` runs once, on the thread that
    /// retires the last one, with the first error seen (if any).
    /// With `count == 0` it runs immediately on the calling thread.
    pub(crate) fn new<F>(count: usize, on_done: F) -> Arc<Self>
    where
        F: FnOnce(std::result::Result<(), DeviceError>) + Send + 'static,
    {
        let tracker = Arc::new(Self {
            remaining: AtomicUsize::new(count),
            first_error: Mutex::new(None),
            on_done: Mutex::new(Some(Box::new(on_done))),
        });
        if count == 0 {
            tracker.finish();
        }
        tracker
    }

    /// Record one command's completion status
    pub(crate) fn complete(&self, status: std::result::Result<(), DeviceError>) {
        if let Err(e) = status {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(e);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let status = match self.first_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if let Some(on_done) = self.on_done.lock().take() {
            on_done(status);
        }
    }
}

// =============================================================================
// InflightOps
// =============================================================================

/// Count of logical operations not yet resolved
#[derive(Default)]
pub(crate) struct InflightOps {
    count: AtomicUsize,
    closing: AtomicBool,
}

/// Held by an operation until it resolves
pub(crate) struct InflightGuard {
    ops: Arc<InflightOps>,
}

impl InflightOps {
    /// Register a new operation; fails once shutdown has begun
    pub(crate) fn enter(self: &Arc<Self>) -> Result<InflightGuard> {
        self.count.fetch_add(1, Ordering::AcqRel);
        if self.closing.load(Ordering::Acquire) {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(NvlogError::ShutDown);
        }
        Ok(InflightGuard {
            ops: Arc::clone(self),
        })
    }

    /// Refuse new operations and wait for the running ones to resolve
    pub(crate) fn close_and_drain(&self) {
        self.closing.store(true, Ordering::Release);
        let backoff = Backoff::new();
        while self.count.load(Ordering::Acquire) != 0 {
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.ops.count.fetch_sub(1, Ordering::AcqRel);
    }
}
