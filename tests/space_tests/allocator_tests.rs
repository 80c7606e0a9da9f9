//! Tests for SegmentAllocator
//!
//! These tests verify:
//! - Segment 0 is never handed out
//! - Lowest-free allocation and exhaustion
//! - Bootstrap marking of persisted segments
//! - Uniqueness under concurrent allocation

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use nvlog::space::SegmentAllocator;
use nvlog::NvlogError;

// =============================================================================
// Basic Allocation Tests
// =============================================================================

#[test]
fn test_segment_zero_reserved() {
    let allocator = SegmentAllocator::new(16);
    assert!(allocator.is_used(0));
    assert_eq!(allocator.used(), 1);
    assert_eq!(allocator.free(), 15);
    assert_eq!(allocator.allocate().unwrap(), 1);
}

#[test]
fn test_allocates_lowest_free() {
    let allocator = SegmentAllocator::new(16);
    assert_eq!(allocator.allocate().unwrap(), 1);
    assert_eq!(allocator.allocate().unwrap(), 2);
    assert!(allocator.mark_used(3));
    assert_eq!(allocator.allocate().unwrap(), 4);
}

#[test]
fn test_exhaustion() {
    let allocator = SegmentAllocator::new(70);
    for expected in 1..70u16 {
        assert_eq!(allocator.allocate().unwrap(), expected);
    }

    let result = allocator.allocate();
    assert!(matches!(result, Err(NvlogError::NoFreeSegment { total: 70 })));
    assert!(result.unwrap_err().is_capacity());
    assert_eq!(allocator.free(), 0);
}

#[test]
fn test_total_clamped_to_u16_ids() {
    let allocator = SegmentAllocator::new(1 << 20);
    assert_eq!(allocator.total(), 65536);
}

// =============================================================================
// Bootstrap Marking Tests
// =============================================================================

#[test]
fn test_mark_used_reports_conflicts() {
    let allocator = SegmentAllocator::new(32);

    assert!(allocator.mark_used(5));
    assert!(!allocator.mark_used(5));
    assert!(!allocator.mark_used(0));
    assert!(!allocator.mark_used(32));
    assert!(allocator.is_used(5));
    assert_eq!(allocator.used(), 2);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_allocation_unique() {
    let allocator = Arc::new(SegmentAllocator::new(4097));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || (0..512).map(|_| allocator.allocate().unwrap()).collect::<Vec<_>>())
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for segment in handle.join().unwrap() {
            assert_ne!(segment, 0);
            assert!(seen.insert(segment), "segment {} handed out twice", segment);
        }
    }
    assert_eq!(seen.len(), 4096);
    assert!(allocator.allocate().is_err());
}
