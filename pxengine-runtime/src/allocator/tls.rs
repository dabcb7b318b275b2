//! Thread-local heap and the thread's active arena
//!
//! Design: while a task runs, its arena is installed as the thread's active
//! arena for the duration of a closure ([`scoped`]); allocation helpers route
//! there. Outside any task they fall back to a lazily created per-thread
//! arena that is never shared.

use super::arena::{Arena, ArenaConfig, ArenaStats};
use super::block::Block;
use crate::error::{ArenaError, Result};
use crate::logging;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;

thread_local! {
    static TLS_HEAP: RefCell<Option<Arena>> = const { RefCell::new(None) };
    static TLS_CONFIG: Cell<Option<ArenaConfig>> = const { Cell::new(None) };
    static ACTIVE: Cell<Option<NonNull<Arena>>> = const { Cell::new(None) };
    static BORROWED: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` with `arena` installed as this thread's active arena.
///
/// The previous active arena (if any) is restored afterwards, also on unwind.
pub fn scoped<R>(arena: &mut Arena, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<NonNull<Arena>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            ACTIVE.with(|active| active.set(self.0));
        }
    }

    let previous = ACTIVE.with(|active| active.replace(Some(NonNull::from(arena))));
    let _restore = Restore(previous);
    f()
}

/// Whether a task arena is installed on this thread.
pub fn has_active() -> bool {
    ACTIVE.with(|active| active.get().is_some())
}

/// Borrow the active arena, or the thread-local heap when none is installed.
///
/// Nested calls on the same thread fail with [`ArenaError::Busy`].
pub fn with_active<R>(f: impl FnOnce(&mut Arena) -> R) -> Result<R> {
    struct Release;

    impl Drop for Release {
        fn drop(&mut self) {
            BORROWED.with(|b| b.set(false));
        }
    }

    if BORROWED.with(|b| b.replace(true)) {
        return Err(ArenaError::Busy);
    }
    let _release = Release;

    match ACTIVE.with(Cell::get) {
        // The pointer came from an exclusive borrow held by `scoped`, and
        // BORROWED keeps this the only live reference to it.
        Some(ptr) => Ok(f(unsafe { &mut *ptr.as_ptr() })),
        None => with_tls_heap(f),
    }
}

fn with_tls_heap<R>(f: impl FnOnce(&mut Arena) -> R) -> Result<R> {
    TLS_HEAP.with(|cell| {
        let mut slot = cell.try_borrow_mut().map_err(|_| ArenaError::Busy)?;
        if slot.is_none() {
            let config = TLS_CONFIG.with(Cell::get).unwrap_or_default();
            let arena = Arena::new(config)?;
            logging::log_tls_heap_init(arena.stats().size);
            *slot = Some(arena);
        }
        match slot.as_mut() {
            Some(arena) => Ok(f(arena)),
            None => Err(ArenaError::Busy),
        }
    })
}

/// Allocate from the active arena (or the thread-local heap).
pub fn alloc(size: usize, align: usize) -> Result<Block> {
    with_active(|arena| arena.allocate(size, align))?
}

/// Allocate and fill from the active arena (or the thread-local heap).
pub fn alloc_bytes(data: &[u8]) -> Result<Block> {
    with_active(|arena| arena.alloc_bytes(data))?
}

/// Copy a block's contents out of the active arena.
pub fn read(block: &Block) -> Result<Vec<u8>> {
    with_active(|arena| arena.bytes(block).map(<[u8]>::to_vec))?
}

/// Sizing for this thread's heap. Only affects a heap not yet created.
pub fn configure_tls_heap(config: ArenaConfig) {
    TLS_CONFIG.with(|c| c.set(Some(config)));
}

/// Stats of this thread's heap, if it exists.
pub fn tls_heap_stats() -> Option<ArenaStats> {
    TLS_HEAP.with(|cell| cell.try_borrow().ok().and_then(|slot| slot.as_ref().map(Arena::stats)))
}

/// Drop this thread's heap, releasing its pages.
pub fn release_tls_heap() {
    TLS_HEAP.with(|cell| {
        if let Ok(mut slot) = cell.try_borrow_mut() {
            slot.take();
        }
    });
}
