//! Per-log write state
//!
//! - Processing permit: a one-token channel. Taking the token admits one
//!   append or metadata update for the log; the token goes back when that
//!   operation's metadata write completes or the operation fails. The token
//!   travels with the operation into the completion path, which a lock
//!   guard could not do.
//! - Entry-sector image: log entries are smaller than a sector, so writing
//!   one means rewriting its whole sector. The image of the sector last
//!   written is kept to avoid reading it back on every append.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{NvlogError, Result};

pub(crate) struct EntrySector {
    /// Virtual offset of the sector in the log-entry space
    pub(crate) offset: u64,
    pub(crate) image: BytesMut,
}

pub(crate) struct LogWriteState {
    permit_tx: Sender<()>,
    permit_rx: Receiver<()>,
    loaded: AtomicBool,
    pub(crate) entry_sector: Mutex<Option<EntrySector>>,
}

/// Exclusive right to change one log's metadata; released on drop
pub(crate) struct Permit {
    tx: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.tx.send(());
    }
}

impl LogWriteState {
    pub(crate) fn new() -> Self {
        let (permit_tx, permit_rx) = channel::bounded(1);
        let _ = permit_tx.send(());
        Self {
            permit_tx,
            permit_rx,
            loaded: AtomicBool::new(false),
            entry_sector: Mutex::new(None),
        }
    }

    /// Block until no other operation on this log is in flight
    pub(crate) fn acquire(&self) -> Result<Permit> {
        self.permit_rx.recv().map_err(|_| NvlogError::ShutDown)?;
        Ok(Permit {
            tx: self.permit_tx.clone(),
        })
    }

    pub(crate) fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}
