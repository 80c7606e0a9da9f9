//! Tests for IoQueues
//!
//! These tests verify:
//! - Commands flow through worker threads and complete exactly once
//! - Multi-span reads are reassembled in order
//! - Back-pressure from a shallow hardware queue
//! - Rejected commands and shutdown behaviour

use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel;
use nvlog::config::Config;
use nvlog::device::{CompletionOrder, DeviceError, IoCommand, MemDevice};
use nvlog::io::IoQueues;
use nvlog::space::Span;

// =============================================================================
// Helper Functions
// =============================================================================

const SECTOR: u32 = 512;
const TIMEOUT: Duration = Duration::from_secs(10);

fn config(io_threads: usize, queue_depth: u32) -> Config {
    Config::builder()
        .io_threads(io_threads)
        .queue_depth(queue_depth)
        .completion_batch(4)
        .build()
}

fn write_cmd(
    lba: u64,
    byte: u8,
    tx: &channel::Sender<(u64, Result<(), DeviceError>)>,
) -> IoCommand {
    let tx = tx.clone();
    IoCommand::write(
        lba,
        Bytes::from(vec![byte; SECTOR as usize]),
        SECTOR,
        Box::new(move |done| tx.send((done.lba, done.status)).unwrap()),
    )
}

fn span(lba: u64, sectors: u32, buf_offset: usize) -> Span {
    Span {
        lba,
        sectors,
        buf_offset,
        len: sectors as usize * SECTOR as usize,
    }
}

// =============================================================================
// Submission Tests
// =============================================================================

#[test]
fn test_data_write_and_read_back() {
    let device = MemDevice::with_capacity(1 << 20);
    let queues = IoQueues::start(&device, &config(2, 8)).unwrap();
    let (tx, rx) = channel::unbounded();

    queues.submit_data(write_cmd(10, 0x11, &tx));
    let (lba, status) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(lba, 10);
    assert!(status.is_ok());

    let data = queues.read_spans(&[span(10, 1, 0)]).wait().unwrap();
    assert!(data.iter().all(|&b| b == 0x11));
}

#[test]
fn test_metadata_queue_is_independent() {
    let device = MemDevice::with_capacity(1 << 20);
    let queues = IoQueues::start(&device, &config(1, 8)).unwrap();
    let (tx, rx) = channel::unbounded();

    queues.submit_metadata(write_cmd(0, 0x22, &tx));
    queues.submit_data(write_cmd(1, 0x33, &tx));
    for _ in 0..2 {
        assert!(rx.recv_timeout(TIMEOUT).unwrap().1.is_ok());
    }

    let stats = queues.stats();
    assert_eq!(stats.metadata.submitted, 1);
    assert_eq!(stats.data.submitted, 1);
    assert_eq!(&device.peek(0, 1)[..], &[0x22u8; 512][..]);
}

#[test]
fn test_read_spans_reassembles_out_of_order() {
    let device = MemDevice::with_capacity(1 << 20).with_completion_order(CompletionOrder::Reversed);
    let queues = IoQueues::start(&device, &config(3, 8)).unwrap();
    let (tx, rx) = channel::unbounded();

    for lba in 0..6u64 {
        queues.submit_data(write_cmd(100 + lba, lba as u8, &tx));
    }
    for _ in 0..6 {
        assert!(rx.recv_timeout(TIMEOUT).unwrap().1.is_ok());
    }

    // Three non-contiguous runs read into one buffer
    let spans = [span(100, 2, 0), span(104, 2, 1024), span(102, 2, 2048)];
    let data = queues.read_spans(&spans).wait().unwrap();
    let per_sector: Vec<u8> = data.chunks(512).map(|chunk| chunk[0]).collect();
    assert_eq!(per_sector, vec![0, 1, 4, 5, 2, 3]);
}

#[test]
fn test_read_spans_surfaces_device_error() {
    let device = MemDevice::with_capacity(1 << 20);
    device.fail_reads(5..6);
    let queues = IoQueues::start(&device, &config(1, 8)).unwrap();

    let result = queues.read_spans(&[span(0, 4, 0), span(4, 4, 2048)]).wait();
    assert!(matches!(result, Err(nvlog::NvlogError::Device(DeviceError::Media { .. }))));
}

#[test]
fn test_read_spans_empty() {
    let device = MemDevice::with_capacity(1 << 20);
    let queues = IoQueues::start(&device, &config(1, 8)).unwrap();
    assert!(queues.read_spans(&[]).wait().unwrap().is_empty());
}

// =============================================================================
// Back-pressure Tests
// =============================================================================

#[test]
fn test_shallow_queue_completes_everything() {
    let device = MemDevice::with_capacity(1 << 20);
    let queues = IoQueues::start(&device, &config(2, 1)).unwrap();
    let (tx, rx) = channel::unbounded();

    for lba in 0..200u64 {
        queues.submit_data(write_cmd(lba, (lba % 251) as u8, &tx));
    }
    let mut seen: Vec<u64> = (0..200)
        .map(|_| {
            let (lba, status) = rx.recv_timeout(TIMEOUT).unwrap();
            assert!(status.is_ok());
            lba
        })
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..200).collect::<Vec<_>>());

    // Counters settle once the workers have exited
    queues.shutdown().unwrap();
    let stats = queues.stats();
    assert_eq!(stats.data.submitted, 200);
    assert_eq!(stats.data.completed, 200);
    assert_eq!(device.peek(199, 1)[0], (199 % 251) as u8);
}

// =============================================================================
// Error and Lifecycle Tests
// =============================================================================

#[test]
fn test_rejected_command_completes_with_error() {
    let device = MemDevice::with_capacity(8 * SECTOR as u64);
    let queues = IoQueues::start(&device, &config(1, 8)).unwrap();
    let (tx, rx) = channel::unbounded();

    queues.submit_data(write_cmd(8, 0x01, &tx));
    let (_, status) = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(status, Err(DeviceError::OutOfRange { .. })));
    assert_eq!(queues.stats().data.rejected, 1);
}

#[test]
fn test_shutdown_drains_outstanding() {
    let device = MemDevice::with_capacity(1 << 20);
    let queues = IoQueues::start(&device, &config(2, 4)).unwrap();
    let (tx, rx) = channel::unbounded();

    for lba in 0..50u64 {
        queues.submit_data(write_cmd(lba, 0x7F, &tx));
    }
    queues.shutdown().unwrap();

    assert_eq!(rx.try_iter().filter(|(_, status)| status.is_ok()).count(), 50);
}

#[test]
fn test_shutdown_reports_panicked_worker() {
    let device = MemDevice::with_capacity(1 << 20);
    let queues = IoQueues::start(&device, &config(1, 4)).unwrap();

    queues.submit_metadata(IoCommand::write(
        0,
        Bytes::from(vec![0u8; SECTOR as usize]),
        SECTOR,
        Box::new(|_| panic!("completion callback failed")),
    ));

    let result = queues.shutdown();
    assert!(matches!(result, Err(nvlog::NvlogError::WorkerPanicked(name)) if name.contains("meta")));
    // Workers are gone; a second call has nothing left to report
    assert!(queues.shutdown().is_ok());
}

#[test]
fn test_submit_after_shutdown_aborts() {
    let device = MemDevice::with_capacity(1 << 20);
    let queues = IoQueues::start(&device, &config(1, 4)).unwrap();
    queues.shutdown().unwrap();

    let (tx, rx) = channel::unbounded();
    queues.submit_data(write_cmd(3, 0x01, &tx));
    queues.submit_metadata(write_cmd(4, 0x01, &tx));

    for _ in 0..2 {
        let (_, status) = rx.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(status, Err(DeviceError::Aborted { .. })));
    }
}
