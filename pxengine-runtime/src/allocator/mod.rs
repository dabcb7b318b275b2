//! Memory allocator - per-task bump arenas with checkpoint/rollback
//!
//! Design: Three-layer architecture:
//! 1. Bump allocation within the current page (fast path)
//! 2. Arena page management and snapshots (slow path, amortized cost)
//! 3. OS memory (rare, bulk acquisition)
//!
//! Each task owns one [`Arena`]; worker threads keep a private heap for
//! allocations made outside any task ([`tls`]). Every page is recorded in
//! the global [`PageIndex`].

mod arena;
mod block;
mod bump;
mod page;
mod pages;
mod snapshot;
pub mod tls;

#[cfg(test)]
mod tests;

pub use arena::{
    AllocCounters, Arena, ArenaConfig, ArenaStats, Cursor, DEFAULT_ARENA_SIZE, MIN_ALIGN,
};
pub use block::{Block, ROOT_SCOPE};
pub use page::os_page_size;
pub use pages::{page_index, OwnerId, PageIndex};
pub use snapshot::{Snapshot, MAX_SNAPSHOTS};
