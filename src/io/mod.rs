//! I/O Module
//!
//! Submission queues, worker threads and the completion path.
//!
//! ## Flow
//! ```text
//!  caller thread                 worker thread (owns one queue pair)
//!  ─────────────                 ───────────────────────────────────
//!  submit_data(cmd) ──► FIFO ──► qpair.submit(cmd)
//!                                   ...
//!  completion.wait() ◄── promise ◄── tracker.complete() ◄── qpair.process_completions()
//! ```
//!
//! Back-pressure comes only from the hardware queue pair: a full pair stalls
//! the worker, which stops draining its FIFO until a slot frees.

mod completion;
mod queues;

pub use completion::Completion;
pub use queues::{IoQueues, IoStats, QueueStats};

pub(crate) use completion::{promise, InflightGuard, InflightOps, Promise, SubRequestTracker};
