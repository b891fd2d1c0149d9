//! Tests for RwAllocator
//!
//! These tests verify:
//! - Slot runs sized to the record length
//! - First-fit reuse of freed runs
//! - Deferred frees wait for the release horizon
//! - Metabits serialization

use keelstore::storage::{RwAllocator, RW_SLOT_SIZE};
use keelstore::{AddressCodec, KeelError};

// =============================================================================
// Helper Functions
// =============================================================================

const META_START: u64 = 512;

fn codec() -> AddressCodec {
    AddressCodec::rw(42).unwrap()
}

// =============================================================================
// Allocation
// =============================================================================

#[test]
fn test_slots_for() {
    assert_eq!(RwAllocator::slots_for(0), 1);
    assert_eq!(RwAllocator::slots_for(1), 1);
    assert_eq!(RwAllocator::slots_for(RW_SLOT_SIZE), 1);
    assert_eq!(RwAllocator::slots_for(RW_SLOT_SIZE + 1), 2);
    assert_eq!(RwAllocator::slots_for(10 * RW_SLOT_SIZE), 10);
}

#[test]
fn test_sequential_allocation() {
    let mut allocator = RwAllocator::new(META_START, true);

    let a = allocator.alloc(100);
    let b = allocator.alloc(300);
    let c = allocator.alloc(1);

    assert_eq!((a, b, c), (0, 1, 4));
    assert_eq!(allocator.allocated_slots(), 5);
    assert_eq!(allocator.extent(), META_START + 5 * RW_SLOT_SIZE);
    assert_eq!(allocator.slot_offset(b), META_START + RW_SLOT_SIZE);
}

#[test]
fn test_first_fit_reuses_freed_run() {
    let mut allocator = RwAllocator::new(META_START, true);
    allocator.alloc(RW_SLOT_SIZE); // 0
    let b = allocator.alloc(3 * RW_SLOT_SIZE); // 1..4
    allocator.alloc(RW_SLOT_SIZE); // 4

    allocator.free(b, 3 * RW_SLOT_SIZE);

    // Too big for the hole: goes to the end
    assert_eq!(allocator.alloc(4 * RW_SLOT_SIZE), 5);
    // Fits the hole
    assert_eq!(allocator.alloc(2 * RW_SLOT_SIZE), 1);
    assert_eq!(allocator.alloc(RW_SLOT_SIZE), 3);
}

#[test]
fn test_free_tail_run_is_extended() {
    let mut allocator = RwAllocator::new(META_START, true);
    allocator.alloc(RW_SLOT_SIZE); // 0
    allocator.alloc(RW_SLOT_SIZE); // 1
    allocator.free(1, RW_SLOT_SIZE);

    let slot = allocator.alloc(3 * RW_SLOT_SIZE);

    assert_eq!(slot, 1);
    assert_eq!(allocator.extent(), META_START + 4 * RW_SLOT_SIZE);
}

#[test]
fn test_allocation_past_full_words() {
    let mut allocator = RwAllocator::new(META_START, true);
    for _ in 0..130 {
        allocator.alloc(RW_SLOT_SIZE);
    }
    allocator.free(129, RW_SLOT_SIZE);

    assert_eq!(allocator.alloc(RW_SLOT_SIZE), 129);
    assert_eq!(allocator.alloc(RW_SLOT_SIZE), 130);
}

#[test]
fn test_claim_marks_run() {
    let mut allocator = RwAllocator::new(META_START, true);

    allocator.claim(2, 2 * RW_SLOT_SIZE);

    assert!(allocator.is_allocated(2));
    assert!(allocator.is_allocated(3));
    assert!(!allocator.is_allocated(0));
    assert_eq!(allocator.alloc(2 * RW_SLOT_SIZE), 0);
    assert_eq!(allocator.alloc(RW_SLOT_SIZE), 4);
}

// =============================================================================
// Deferred Frees
// =============================================================================

#[test]
fn test_deferred_free_waits_for_horizon() {
    let codec = codec();
    let mut allocator = RwAllocator::new(META_START, true);
    let slot = allocator.alloc(200);
    let addr = codec.encode(slot, 200).unwrap();

    allocator.defer_free(addr, 5);

    assert_eq!(allocator.reclaim(&codec, 4).unwrap(), 0);
    assert!(allocator.is_allocated(slot));
    assert_eq!(allocator.deferred().len(), 1);

    assert_eq!(allocator.reclaim(&codec, 5).unwrap(), 1);
    assert!(!allocator.is_allocated(slot));
    assert!(!allocator.is_allocated(slot + 1));
    assert!(allocator.deferred().is_empty());
    assert_eq!(allocator.release_horizon(), 5);
}

#[test]
fn test_release_horizon_never_moves_back() {
    let mut allocator = RwAllocator::new(META_START, true);

    allocator.reclaim(&codec(), 9).unwrap();
    allocator.reclaim(&codec(), 3).unwrap();

    assert_eq!(allocator.release_horizon(), 9);
}

#[test]
fn test_untracked_frees_are_dropped() {
    let codec = codec();
    let mut allocator = RwAllocator::new(META_START, false);
    let slot = allocator.alloc(10);

    allocator.defer_free(codec.encode(slot, 10).unwrap(), 1);

    assert!(allocator.deferred().is_empty());
    assert_eq!(allocator.reclaim(&codec, u64::MAX).unwrap(), 0);
    assert!(allocator.is_allocated(slot));
}

#[test]
fn test_reclaim_rejects_bad_address() {
    let mut allocator = RwAllocator::new(META_START, true);
    allocator.defer_free(7, 1);

    let err = allocator.reclaim(&codec(), 1).unwrap_err();

    assert!(matches!(err, KeelError::RecordCorrupted { addr: 7, .. }));
}

// =============================================================================
// Metabits
// =============================================================================

#[test]
fn test_metabits_round_trip() {
    let codec = codec();
    let mut allocator = RwAllocator::new(META_START, true);
    allocator.alloc(500);
    let slot = allocator.alloc(100);
    allocator.defer_free(codec.encode(slot, 100).unwrap(), 3);
    allocator.reclaim(&codec, 2).unwrap();

    let restored = RwAllocator::from_bytes(&allocator.to_bytes().unwrap(), true).unwrap();

    assert_eq!(restored.extent(), allocator.extent());
    assert_eq!(restored.allocated_slots(), allocator.allocated_slots());
    assert_eq!(restored.deferred(), allocator.deferred());
    assert_eq!(restored.release_horizon(), 2);
    assert_eq!(restored.meta_start(), META_START);
}

#[test]
fn test_metabits_without_tracking_drop_deferred() {
    let mut allocator = RwAllocator::new(META_START, true);
    allocator.alloc(100);
    allocator.defer_free(codec().encode(0, 100).unwrap(), 1);

    let restored = RwAllocator::from_bytes(&allocator.to_bytes().unwrap(), false).unwrap();

    assert!(restored.deferred().is_empty());
}

#[test]
fn test_metabits_garbage_rejected() {
    let err = RwAllocator::from_bytes(&[1, 2, 3], true).unwrap_err();

    assert!(matches!(err, KeelError::Serialization(_)));
}
