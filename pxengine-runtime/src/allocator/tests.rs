//! Allocator tests - comprehensive validation
//!
//! Test suite organized by component:
//! - Arena Core: allocation, alignment, growth
//! - Reallocation and Free
//! - Snapshots: exact inverse, LIFO enforcement, slot exhaustion
//! - Block Handles: owner and scope checks
//! - Page Index: ownership queries
//! - Thread-Local Heap: active arena routing
//! - Properties: monotonicity and disjointness under random workloads

use super::*;
use crate::error::ArenaError;
use proptest::prelude::*;

fn small_arena() -> Arena {
    Arena::new(ArenaConfig::new().with_default_size(4096)).expect("arena")
}

// ===== Arena Core Tests =====

#[test]
fn arena_creation_reserves_first_page() {
    let arena = Arena::with_defaults().expect("arena");
    let stats = arena.stats();
    assert_eq!(stats.pages, 1);
    assert!(stats.size >= DEFAULT_ARENA_SIZE);
    assert_eq!(stats.counters, AllocCounters::default());
    assert_eq!(stats.snapshots, 0);
}

#[test]
fn sequential_allocations_are_increasing_and_distinct() {
    let mut arena = small_arena();

    let a = arena.allocate(64, 8).expect("first alloc");
    let b = arena.allocate(64, 8).expect("second alloc");
    let c = arena.allocate(64, 8).expect("third alloc");

    assert!(a.addr() < b.addr());
    assert!(b.addr() < c.addr());
    assert!(a.is_disjoint(&b) && b.is_disjoint(&c) && a.is_disjoint(&c));
    assert_eq!(arena.counters().mallocs, 3);
    assert_eq!(arena.counters().allocated, 192);
}

#[test]
fn allocation_alignment_powers_of_two() {
    let mut arena = small_arena();

    for align in [1, 2, 4, 8, 16, 32, 64, 128, 256] {
        let block = arena.allocate(3, align).expect("aligned alloc");
        assert_eq!(block.addr() % align.max(MIN_ALIGN), 0, "not aligned to {}", align);
    }
    assert!(arena.counters().alignment_mismatches > 0);
    assert!(arena.counters().bytes_wasted > 0);
}

#[test]
fn invalid_alignment_is_rejected() {
    let mut arena = small_arena();
    assert_eq!(
        arena.allocate(8, 3),
        Err(ArenaError::InvalidLayout { size: 8, align: 3 })
    );
    assert_eq!(
        arena.allocate(8, 0),
        Err(ArenaError::InvalidLayout { size: 8, align: 0 })
    );
    assert_eq!(arena.counters().mallocs, 0);
}

#[test]
fn large_allocation_links_a_sized_page() {
    let mut arena = small_arena();

    let size = 128 * 1024;
    let block = arena.allocate(size, 8).expect("large alloc");
    let stats = arena.stats();
    assert_eq!(stats.pages, 2);
    assert!(stats.size >= size + 4096);
    assert_eq!(stats.size % arena.page_size(), 0);

    arena.bytes_mut(&block).expect("bytes").fill(0xAA);
    assert!(arena.bytes(&block).expect("bytes").iter().all(|&b| b == 0xAA));
}

#[test]
fn memory_handed_out_is_zeroed() {
    let mut arena = small_arena();
    let block = arena.allocate(256, 8).expect("alloc");
    assert!(arena.bytes(&block).expect("bytes").iter().all(|&b| b == 0));
}

#[test]
fn stress_many_small_allocations() {
    let mut arena = small_arena();

    for _ in 0..1000 {
        arena.allocate(16, 8).expect("small alloc");
    }

    let stats = arena.stats();
    assert!(stats.size >= 16 * 1000);
    assert_eq!(stats.counters.mallocs, 1000);
}

// ===== Reallocation and Free Tests =====

#[test]
fn reallocate_copies_forward() {
    let mut arena = small_arena();
    let old = arena.alloc_bytes(b"hello world").expect("alloc");

    let grown = arena.reallocate(&old, 32).expect("realloc");
    assert_ne!(grown.addr(), old.addr());
    assert_eq!(&arena.bytes(&grown).unwrap()[..11], b"hello world");
    assert!(arena.bytes(&grown).unwrap()[11..].iter().all(|&b| b == 0));

    let shrunk = arena.reallocate(&grown, 5).expect("realloc");
    assert_eq!(arena.bytes(&shrunk).unwrap(), b"hello");

    // The old block is dead space but still readable.
    assert_eq!(arena.bytes(&old).unwrap(), b"hello world");
    assert_eq!(arena.counters().reallocs, 2);
}

#[test]
fn free_only_counts() {
    let mut arena = small_arena();
    let block = arena.allocate(64, 8).expect("alloc");
    let before = arena.cursor();
    arena.free(&block);
    assert_eq!(arena.cursor(), before);
    assert_eq!(arena.counters().frees, 1);
    assert!(arena.is_live(&block));
}

// ===== Snapshot Tests =====

#[test]
fn rollback_restores_cursor_and_counters() {
    let mut arena = small_arena();
    arena.allocate(100, 8).expect("alloc");

    let snap = arena.snapshot().expect("snapshot");
    let cursor = arena.cursor();
    let counters = arena.counters();

    for _ in 0..100 {
        arena.allocate(200, 16).expect("alloc");
    }
    assert!(arena.stats().pages > 1);

    arena.rollback(&snap).expect("rollback");
    assert_eq!(arena.cursor(), cursor);
    assert_eq!(arena.counters(), counters);
    assert_eq!(arena.snapshot_depth(), 0);
}

#[test]
fn rollback_zeroes_reclaimed_bytes() {
    let mut arena = small_arena();
    let snap = arena.snapshot().expect("snapshot");
    let block = arena.alloc_bytes(&[0xFF; 128]).expect("alloc");
    let addr = block.addr();
    arena.rollback(&snap).expect("rollback");

    let again = arena.allocate(128, 1).expect("alloc");
    assert_eq!(again.addr(), addr);
    assert!(arena.bytes(&again).unwrap().iter().all(|&b| b == 0));
}

#[test]
fn lazy_zeroing_still_hands_out_zeroed_memory() {
    let mut arena =
        Arena::new(ArenaConfig::new().with_default_size(4096).with_zero_on_rollback(false))
            .expect("arena");
    let snap = arena.snapshot().expect("snapshot");
    arena.alloc_bytes(&[0xEE; 64]).expect("alloc");
    arena.rollback(&snap).expect("rollback");

    let block = arena.allocate(64, 1).expect("alloc");
    assert!(arena.bytes(&block).unwrap().iter().all(|&b| b == 0));
}

#[test]
fn rollback_of_older_snapshot_is_rejected() {
    let mut arena = small_arena();
    let outer = arena.snapshot().expect("outer");
    arena.allocate(32, 8).expect("alloc");
    let inner = arena.snapshot().expect("inner");
    arena.allocate(32, 8).expect("alloc");
    let cursor = arena.cursor();

    let err = arena.rollback(&outer).unwrap_err();
    assert_eq!(
        err,
        ArenaError::SnapshotNotNewest {
            id: outer.id(),
            newest: inner.id()
        }
    );
    // Nothing changed.
    assert_eq!(arena.cursor(), cursor);
    assert_eq!(arena.snapshot_depth(), 2);

    arena.rollback(&inner).expect("inner");
    arena.rollback(&outer).expect("outer");
}

#[test]
fn take_requires_newest_as_previous() {
    let mut arena = small_arena();
    let root = arena.take_snapshot(None).expect("root");
    let child = arena.take_snapshot(Some(&root)).expect("child");

    assert!(matches!(
        arena.take_snapshot(Some(&root)),
        Err(ArenaError::SnapshotNotNewest { .. })
    ));
    assert!(matches!(
        arena.take_snapshot(None),
        Err(ArenaError::SnapshotNotNewest { .. })
    ));
    assert_eq!(arena.snapshot_depth(), 2);
    arena.rollback(&child).expect("child");
}

#[test]
fn double_rollback_is_unknown() {
    let mut arena = small_arena();
    let snap = arena.snapshot().expect("snapshot");
    arena.rollback(&snap).expect("first");
    assert_eq!(
        arena.rollback(&snap),
        Err(ArenaError::UnknownSnapshot { id: snap.id() })
    );
}

#[test]
fn lowest_free_slot_is_reused() {
    let mut arena = small_arena();
    let a = arena.snapshot().expect("a");
    let b = arena.snapshot().expect("b");
    assert_eq!((a.slot(), b.slot()), (0, 1));
    arena.rollback(&b).expect("b");
    let c = arena.snapshot().expect("c");
    assert_eq!(c.slot(), 1);
    assert_ne!(c.id(), b.id());
}

#[test]
fn snapshot_slots_are_bounded() {
    let mut arena = small_arena();
    let mut open = Vec::new();
    for _ in 0..MAX_SNAPSHOTS {
        open.push(arena.snapshot().expect("slot"));
    }
    assert_eq!(arena.snapshot(), Err(ArenaError::SnapshotsExhausted));
    assert_eq!(arena.reset_to_root(), MAX_SNAPSHOTS);
    assert!(arena.snapshot().is_ok());
}

#[test]
fn reset_to_root_unwinds_everything() {
    let mut arena = small_arena();
    let keep = arena.alloc_bytes(b"bootstrap").expect("alloc");
    let cursor = arena.cursor();
    let counters = arena.counters();

    let root = arena.snapshot().expect("root");
    arena.allocate(500, 8).expect("alloc");
    let _child = arena.take_snapshot(Some(&root)).expect("child");
    arena.allocate(9000, 8).expect("alloc");

    assert_eq!(arena.reset_to_root(), 2);
    assert_eq!(arena.cursor(), cursor);
    assert_eq!(arena.counters(), counters);
    assert_eq!(arena.bytes(&keep).unwrap(), b"bootstrap");
}

// ===== Block Handle Tests =====

#[test]
fn rolled_back_blocks_are_stale() {
    let mut arena = small_arena();
    let root_block = arena.allocate(8, 8).expect("root");
    let snap = arena.snapshot().expect("snapshot");
    let scoped = arena.allocate(8, 8).expect("scoped");
    assert_eq!(scoped.scope(), snap.id());
    assert_eq!(root_block.scope(), ROOT_SCOPE);

    arena.rollback(&snap).expect("rollback");
    assert_eq!(
        arena.bytes(&scoped),
        Err(ArenaError::StaleBlock { scope: snap.id() })
    );
    assert!(arena.is_live(&root_block));
    assert!(arena.reallocate(&scoped, 16).is_err());
}

#[test]
fn blocks_from_another_arena_are_rejected() {
    let mut a = small_arena();
    let b = small_arena();
    let block = a.allocate(8, 8).expect("alloc");
    assert_eq!(b.bytes(&block), Err(ArenaError::ForeignBlock));
}

#[test]
fn write_truncates_to_block() {
    let mut arena = small_arena();
    let block = arena.allocate(4, 1).expect("alloc");
    assert_eq!(arena.write(&block, b"abcdef").unwrap(), 4);
    assert_eq!(arena.bytes(&block).unwrap(), b"abcd");
}

// ===== Page Index Tests =====

#[test]
fn page_index_tracks_ownership() {
    let mut arena = small_arena();
    let block = arena.allocate(32, 8).expect("alloc");
    let big = arena.allocate(256 * 1024, 8).expect("alloc");

    let index = page_index();
    assert_eq!(index.owner_of(block.as_ptr()), Some(arena.owner()));
    assert_eq!(index.owner_of(big.as_ptr()), Some(arena.owner()));
    assert!(arena.contains(big.as_ptr()));

    let probe = block.as_ptr();
    let owner = arena.owner();
    drop(arena);
    assert_ne!(index.owner_of(probe), Some(owner));
}

#[test]
fn owner_ids_are_unique() {
    let a = OwnerId::next();
    let b = OwnerId::next();
    assert!(b > a);
}

#[test]
fn local_index_registers_by_granule() {
    let index = PageIndex::new(4096);
    let owner = OwnerId::next();
    index.register(0x10000, 3 * 4096, owner);
    assert_eq!(index.len(), 3);
    assert_eq!(index.owner_of(0x10010 as *const u8), Some(owner));
    assert_eq!(index.owner_of(0x12fff as *const u8), Some(owner));
    assert_eq!(index.owner_of(0x13000 as *const u8), None);
    index.unregister(0x10000, 3 * 4096);
    assert!(index.is_empty());
}

// ===== Thread-Local Heap Tests =====

#[test]
fn tls_alloc_uses_thread_heap_without_active_arena() {
    std::thread::spawn(|| {
        assert!(!tls::has_active());
        assert!(tls::tls_heap_stats().is_none());
        let block = tls::alloc_bytes(b"local").expect("alloc");
        assert_eq!(tls::read(&block).unwrap(), b"local");
        assert_eq!(tls::tls_heap_stats().unwrap().counters.mallocs, 1);
        tls::release_tls_heap();
        assert!(tls::tls_heap_stats().is_none());
    })
    .join()
    .unwrap();
}

#[test]
fn scoped_routes_to_active_arena() {
    let mut arena = small_arena();
    let block = tls::scoped(&mut arena, || {
        assert!(tls::has_active());
        tls::alloc_bytes(b"task").expect("alloc")
    });
    assert!(!tls::has_active());
    assert_eq!(block.owner(), arena.owner());
    assert_eq!(arena.bytes(&block).unwrap(), b"task");
}

#[test]
fn nested_scopes_restore_previous() {
    let mut outer = small_arena();
    let mut inner = small_arena();
    let inner_owner = inner.owner();
    let outer_owner = outer.owner();

    tls::scoped(&mut outer, || {
        let b = tls::scoped(&mut inner, || tls::alloc(8, 8).unwrap());
        assert_eq!(b.owner(), inner_owner);
        let a = tls::alloc(8, 8).unwrap();
        assert_eq!(a.owner(), outer_owner);
    });
}

#[test]
fn reentrant_borrow_is_busy() {
    let mut arena = small_arena();
    tls::scoped(&mut arena, || {
        let nested = tls::with_active(|_| tls::alloc(8, 8)).expect("outer borrow");
        assert_eq!(nested, Err(ArenaError::Busy));
    });
}

// ===== Property Tests =====

proptest! {
    #[test]
    fn prop_allocations_monotonic_and_disjoint(
        requests in prop::collection::vec((0usize..3000, 0u32..8), 1..120)
    ) {
        let mut arena = small_arena();
        let mut blocks: Vec<Block> = Vec::new();
        let mut last = arena.cursor();

        for (size, shift) in requests {
            let block = arena.allocate(size, 1usize << shift).unwrap();
            let cursor = arena.cursor();
            prop_assert!(cursor >= last);
            last = cursor;
            for other in &blocks {
                prop_assert!(block.is_empty() || other.is_empty() || block.is_disjoint(other));
            }
            blocks.push(block);
        }
    }

    #[test]
    fn prop_snapshot_is_exact_inverse(
        before in prop::collection::vec(1usize..2000, 0..20),
        after in prop::collection::vec(1usize..5000, 0..40),
    ) {
        let mut arena = small_arena();
        for size in before {
            arena.allocate(size, 8).unwrap();
        }
        let snap = arena.snapshot().unwrap();
        let cursor = arena.cursor();
        let counters = arena.counters();
        for size in after {
            arena.allocate(size, 16).unwrap();
        }
        arena.rollback(&snap).unwrap();
        prop_assert_eq!(arena.cursor(), cursor);
        prop_assert_eq!(arena.counters(), counters);
    }
}
