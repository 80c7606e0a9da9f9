//! Tests for AddressTranslator
//!
//! These tests verify:
//! - Virtual offset → device address arithmetic
//! - Allocation on write, no allocation on read
//! - Table-length limits per address space
//! - Span splitting at segment boundaries and the transfer limit

use std::sync::Arc;

use nvlog::config::Layout;
use nvlog::device::Geometry;
use nvlog::metadata::AddressTable;
use nvlog::space::{AddressSpace, AddressTranslator, SegmentAllocator};
use nvlog::NvlogError;

// =============================================================================
// Helper Functions
// =============================================================================

fn small_layout() -> Layout {
    Layout {
        segment_bits: 16,
        max_logs: 4,
        log_entry_table_len: 4,
        data_table_len: 8,
    }
}

fn geometry(max_sectors_per_io: u32) -> Geometry {
    Geometry {
        sector_size: 512,
        max_sectors_per_io,
        capacity_sectors: (64 << 16) / 512,
    }
}

fn translator(max_sectors_per_io: u32) -> AddressTranslator {
    let layout = small_layout();
    let tables = (0..layout.max_logs).map(|_| AddressTable::new(&layout)).collect();
    AddressTranslator::new(
        layout,
        geometry(max_sectors_per_io),
        Arc::new(SegmentAllocator::new(64)),
        tables,
    )
}

// =============================================================================
// Translate Tests
// =============================================================================

#[test]
fn test_translate_allocates_on_write() {
    let t = translator(256);

    // First segment goes to physical segment 1
    let address = t.translate(0, AddressSpace::Data, 100, true).unwrap();
    assert_eq!(address, (1 << 16) | 100);

    // Same virtual segment, same physical one
    let again = t.translate(0, AddressSpace::Data, 4000, true).unwrap();
    assert_eq!(again, (1 << 16) | 4000);
    assert_eq!(t.allocator().used(), 2);
}

#[test]
fn test_translate_without_allocate_fails_on_unmapped() {
    let t = translator(256);
    let result = t.translate(1, AddressSpace::LogEntry, 0, false);
    assert!(matches!(
        result,
        Err(NvlogError::SegmentUnmapped { log_id: 1, space: AddressSpace::LogEntry, segment_index: 0 })
    ));
    assert_eq!(t.allocator().used(), 1);
}

#[test]
fn test_spaces_and_logs_are_independent() {
    let t = translator(256);
    let a_data = t.translate(0, AddressSpace::Data, 0, true).unwrap();
    let a_entries = t.translate(0, AddressSpace::LogEntry, 0, true).unwrap();
    let b_data = t.translate(1, AddressSpace::Data, 0, true).unwrap();

    assert_ne!(a_data >> 16, a_entries >> 16);
    assert_ne!(a_data >> 16, b_data >> 16);
}

#[test]
fn test_table_length_limit() {
    let t = translator(256);
    let limit = 4u64 << 16;

    assert!(t.translate(0, AddressSpace::LogEntry, limit - 1, true).is_ok());
    let result = t.translate(0, AddressSpace::LogEntry, limit, true);
    assert!(matches!(
        result,
        Err(NvlogError::AddressSpaceExhausted { segment_index: 4, table_len: 4, .. })
    ));

    // Data space has its own, longer table
    assert!(t.translate(0, AddressSpace::Data, limit, true).is_ok());
}

#[test]
fn test_unknown_log() {
    let t = translator(256);
    assert!(matches!(
        t.translate(9, AddressSpace::Data, 0, true),
        Err(NvlogError::UnknownLog(9))
    ));
}

// =============================================================================
// Span Tests
// =============================================================================

#[test]
fn test_spans_split_at_segment_boundary() {
    let t = translator(256);
    let segment = 1u64 << 16;

    let spans = t
        .spans(0, AddressSpace::Data, segment - 1024, 3072, true)
        .unwrap();
    assert_eq!(spans.len(), 2);

    assert_eq!(spans[0].buf_offset, 0);
    assert_eq!(spans[0].len, 1024);
    assert_eq!(spans[0].sectors, 2);
    assert_eq!(spans[0].lba, ((1 << 16) + segment - 1024) / 512);

    assert_eq!(spans[1].buf_offset, 1024);
    assert_eq!(spans[1].len, 2048);
    assert_eq!(spans[1].lba, (2 << 16) / 512);
}

#[test]
fn test_spans_split_at_transfer_limit() {
    let t = translator(4);
    let spans = t.spans(0, AddressSpace::Data, 0, 10 * 512, true).unwrap();

    let lens: Vec<usize> = spans.iter().map(|s| s.len).collect();
    assert_eq!(lens, vec![2048, 2048, 1024]);
    assert_eq!(spans[1].lba, spans[0].lba + 4);
}

#[test]
fn test_spans_require_alignment() {
    let t = translator(256);
    assert!(matches!(
        t.spans(0, AddressSpace::Data, 100, 512, true),
        Err(NvlogError::Misaligned { .. })
    ));
    assert!(matches!(
        t.spans(0, AddressSpace::Data, 0, 100, true),
        Err(NvlogError::Misaligned { .. })
    ));
}

#[test]
fn test_spans_past_table_allocate_nothing() {
    let t = translator(256);
    let end_of_space = 8u64 << 16;

    let result = t.spans(0, AddressSpace::Data, end_of_space - 512, 1024, true);
    assert!(matches!(result, Err(NvlogError::AddressSpaceExhausted { .. })));
    assert_eq!(t.allocator().used(), 1);
}

#[test]
fn test_snapshot_reflects_mappings() {
    let t = translator(256);
    t.translate(2, AddressSpace::Data, 3 << 16, true).unwrap();

    let table = t.snapshot(2).unwrap();
    assert_eq!(table.get(AddressSpace::Data, 3), Some(1));
    assert_eq!(table.mapped_segments().count(), 1);
}
