//! Tests for block devices and probe/attach
//!
//! These tests verify:
//! - Queue pair submit / poll semantics (ordering, queue full, rejection)
//! - RAM device fault injection and shared media across clones
//! - File device persistence
//! - Probe filtering and attach

use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel;
use nvlog::device::{
    BlockDevice, CompletionOrder, ControllerInfo, DeviceError, DeviceProbe, FileDevice, Geometry,
    IoCommand, IoCompletion, MemDevice, SubmitError,
};
use nvlog::NvlogError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const SECTOR: u32 = 512;

fn sector_of(byte: u8) -> Bytes {
    Bytes::from(vec![byte; SECTOR as usize])
}

/// Write command whose completion is forwarded to `tx`
fn write_cmd(lba: u64, data: Bytes, tx: &channel::Sender<IoCompletion>) -> IoCommand {
    let tx = tx.clone();
    IoCommand::write(lba, data, SECTOR, Box::new(move |done| tx.send(done).unwrap()))
}

fn read_cmd(lba: u64, count: u32, tx: &channel::Sender<IoCompletion>) -> IoCommand {
    let tx = tx.clone();
    IoCommand::read(lba, count, SECTOR, Box::new(move |done| tx.send(done).unwrap()))
}

fn controller(addr: &str) -> ControllerInfo {
    ControllerInfo {
        transport_addr: addr.to_string(),
        model: "test".to_string(),
    }
}

// =============================================================================
// Queue Pair Tests
// =============================================================================

#[test]
fn test_write_then_read() {
    let device = MemDevice::with_capacity(1 << 20);
    let mut qpair = device.alloc_queue_pair(8).unwrap();
    let (tx, rx) = channel::unbounded();

    qpair.submit(write_cmd(3, sector_of(0xAB), &tx)).unwrap();
    assert_eq!(qpair.outstanding(), 1);
    assert_eq!(qpair.process_completions(16), 1);
    assert!(rx.recv().unwrap().status.is_ok());

    qpair.submit(read_cmd(3, 1, &tx)).unwrap();
    qpair.process_completions(16);
    let done = rx.recv().unwrap();
    assert!(done.status.is_ok());
    assert!(done.buffer.into_read().iter().all(|&b| b == 0xAB));
}

#[test]
fn test_unwritten_sectors_read_zero() {
    let device = MemDevice::with_capacity(1 << 20);
    assert!(device.peek(100, 2).iter().all(|&b| b == 0));
}

#[test]
fn test_queue_full() {
    let device = MemDevice::with_capacity(1 << 20);
    let mut qpair = device.alloc_queue_pair(1).unwrap();
    let (tx, rx) = channel::unbounded();

    qpair.submit(write_cmd(0, sector_of(1), &tx)).unwrap();
    let second = match qpair.submit(write_cmd(1, sector_of(2), &tx)) {
        Err(SubmitError::QueueFull(cmd)) => cmd,
        other => panic!("expected QueueFull, got {:?}", other),
    };

    // Reaping frees the slot; the handed-back command is still usable
    assert_eq!(qpair.process_completions(1), 1);
    qpair.submit(second).unwrap();
    qpair.process_completions(1);

    assert_eq!(rx.try_iter().count(), 2);
    assert_eq!(&device.peek(1, 1)[..], &sector_of(2)[..]);
}

#[test]
fn test_out_of_range_rejected() {
    let device = MemDevice::with_capacity(4 * SECTOR as u64);
    let mut qpair = device.alloc_queue_pair(4).unwrap();
    let (tx, _rx) = channel::unbounded();

    match qpair.submit(read_cmd(3, 2, &tx)) {
        Err(SubmitError::Rejected(_, DeviceError::OutOfRange { lba: 3, count: 2, capacity: 4 })) => {}
        other => panic!("expected OutOfRange, got {:?}", other),
    }
}

#[test]
fn test_oversized_transfer_rejected() {
    let device = MemDevice::new(Geometry {
        sector_size: SECTOR,
        max_sectors_per_io: 2,
        capacity_sectors: 64,
    });
    let mut qpair = device.alloc_queue_pair(4).unwrap();
    let (tx, _rx) = channel::unbounded();

    let result = qpair.submit(read_cmd(0, 3, &tx));
    assert!(matches!(
        result,
        Err(SubmitError::Rejected(_, DeviceError::BadBuffer { count: 3, .. }))
    ));
}

#[test]
fn test_reversed_completion_order() {
    let device = MemDevice::with_capacity(1 << 20).with_completion_order(CompletionOrder::Reversed);
    let mut qpair = device.alloc_queue_pair(8).unwrap();
    let (tx, rx) = channel::unbounded();

    for lba in 0..4 {
        qpair.submit(write_cmd(lba, sector_of(lba as u8), &tx)).unwrap();
    }
    assert_eq!(qpair.process_completions(8), 4);

    let order: Vec<u64> = rx.try_iter().map(|done| done.lba).collect();
    assert_eq!(order, vec![3, 2, 1, 0]);
}

#[test]
fn test_process_completions_respects_batch() {
    let device = MemDevice::with_capacity(1 << 20);
    let mut qpair = device.alloc_queue_pair(8).unwrap();
    let (tx, _rx) = channel::unbounded();

    for lba in 0..5 {
        qpair.submit(write_cmd(lba, sector_of(1), &tx)).unwrap();
    }
    assert_eq!(qpair.process_completions(2), 2);
    assert_eq!(qpair.outstanding(), 3);
    assert_eq!(qpair.process_completions(10), 3);
    assert_eq!(qpair.process_completions(10), 0);
}

// =============================================================================
// Fault Injection Tests
// =============================================================================

#[test]
fn test_injected_write_fault_leaves_medium_untouched() {
    let device = MemDevice::with_capacity(1 << 20);
    device.fail_writes(10..12);
    let mut qpair = device.alloc_queue_pair(8).unwrap();
    let (tx, rx) = channel::unbounded();

    qpair.submit(write_cmd(11, sector_of(0xFF), &tx)).unwrap();
    qpair.submit(write_cmd(12, sector_of(0xEE), &tx)).unwrap();
    qpair.process_completions(8);

    let results: Vec<_> = rx.try_iter().map(|done| (done.lba, done.status)).collect();
    assert!(matches!(results[0], (11, Err(DeviceError::Media { lba: 11, .. }))));
    assert!(matches!(results[1], (12, Ok(()))));
    assert!(device.peek(11, 1).iter().all(|&b| b == 0));
    assert_eq!(device.write_count(), 1);

    device.clear_faults();
    qpair.submit(write_cmd(11, sector_of(0xFF), &tx)).unwrap();
    qpair.process_completions(8);
    assert!(rx.recv().unwrap().status.is_ok());
}

#[test]
fn test_injected_read_fault() {
    let device = MemDevice::with_capacity(1 << 20);
    device.fail_reads(0..1);
    let mut qpair = device.alloc_queue_pair(8).unwrap();
    let (tx, rx) = channel::unbounded();

    qpair.submit(read_cmd(0, 2, &tx)).unwrap();
    qpair.process_completions(8);
    assert!(rx.recv().unwrap().status.is_err());
    assert_eq!(device.read_count(), 0);
}

#[test]
fn test_clones_share_medium() {
    let device = MemDevice::with_capacity(1 << 20);
    let clone = device.clone();
    let mut qpair = device.alloc_queue_pair(8).unwrap();
    let (tx, _rx) = channel::unbounded();

    qpair.submit(write_cmd(7, sector_of(0x42), &tx)).unwrap();
    qpair.process_completions(8);

    assert_eq!(&clone.peek(7, 1)[..], &sector_of(0x42)[..]);
}

// =============================================================================
// File Device Tests
// =============================================================================

#[test]
fn test_file_device_persists_across_open() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("disk.img");

    {
        let device = FileDevice::create(&path, SECTOR, 1 << 20).unwrap();
        assert_eq!(device.geometry().capacity_sectors, 2048);
        let mut qpair = device.alloc_queue_pair(4).unwrap();
        let (tx, rx) = channel::unbounded();
        qpair.submit(write_cmd(5, sector_of(0x5A), &tx)).unwrap();
        qpair.process_completions(4);
        assert!(rx.recv().unwrap().status.is_ok());
    }

    let device = FileDevice::open(&path, SECTOR).unwrap();
    assert_eq!(device.path(), path.as_path());
    let mut qpair = device.alloc_queue_pair(4).unwrap();
    let (tx, rx) = channel::unbounded();
    qpair.submit(read_cmd(5, 1, &tx)).unwrap();
    qpair.process_completions(4);
    assert!(rx.recv().unwrap().buffer.into_read().iter().all(|&b| b == 0x5A));
}

#[test]
fn test_file_device_rejects_bad_sector_size() {
    let temp_dir = TempDir::new().unwrap();
    let result = FileDevice::create(temp_dir.path().join("bad.img"), 500, 1 << 20);
    assert!(matches!(result, Err(NvlogError::Config(_))));
}

// =============================================================================
// Probe / Attach Tests
// =============================================================================

#[test]
fn test_probe_accepts_first_without_filter() {
    let mut probe = DeviceProbe::new(None);
    let a: Arc<dyn BlockDevice> = Arc::new(MemDevice::with_capacity(1 << 20));
    let b: Arc<dyn BlockDevice> = Arc::new(MemDevice::with_capacity(2 << 20));

    probe.run(vec![(controller("0000:01:00.0"), a), (controller("0000:02:00.0"), b)]);

    assert_eq!(probe.attached().unwrap().transport_addr, "0000:01:00.0");
    assert_eq!(probe.into_device().unwrap().geometry().capacity_sectors, 2048);
}

#[test]
fn test_probe_filter() {
    let probe = DeviceProbe::new(Some("0000:02:00.0".to_string()));
    assert!(!probe.probe(&controller("0000:01:00.0")));
    assert!(probe.probe(&controller("0000:02:00.0")));
}

#[test]
fn test_probe_rejects_after_attach() {
    let mut probe = DeviceProbe::new(None);
    probe.attach(controller("a"), Arc::new(MemDevice::with_capacity(1 << 20)));
    assert!(!probe.probe(&controller("b")));
}

#[test]
fn test_probe_without_match_has_no_device() {
    let mut probe = DeviceProbe::new(Some("missing".to_string()));
    let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::with_capacity(1 << 20));
    probe.run(vec![(controller("present"), dev)]);

    assert!(probe.attached().is_none());
    assert!(matches!(probe.into_device(), Err(NvlogError::NoDevice)));
}
