//! Arena - growable bump allocator with checkpoint/rollback
//!
//! Design: a list of page-aligned OS regions plus a cursor (page, offset).
//! Allocation bumps the cursor; growth links a new page sized to
//! `max(default_size, request)` rounded to the page granularity. Nothing is
//! freed in place: memory comes back only through rollback or drop.

use super::block::Block;
use super::bump::{Bump, Bumped};
use super::page::{os_page_size, round_up, Page};
use super::pages::{page_index, OwnerId};
use super::snapshot::{SavedState, Snapshot, SnapshotSet};
use crate::error::{ArenaError, Result};
use crate::logging;
use core::ptr::NonNull;

/// Arena size strategy - balances memory overhead vs syscall frequency
pub const DEFAULT_ARENA_SIZE: usize = 64 * 1024;

/// Every block is aligned to at least a pointer.
pub const MIN_ALIGN: usize = core::mem::size_of::<usize>();

/// Sizing and rollback policy for one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Minimum size of each page, before rounding.
    pub default_size: usize,
    /// Page granularity; 0 means the OS page size.
    pub page_size: usize,
    /// Zero rolled-back bytes eagerly instead of zeroing at allocation.
    pub zero_on_rollback: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            default_size: DEFAULT_ARENA_SIZE,
            page_size: 0,
            zero_on_rollback: true,
        }
    }
}

impl ArenaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_size(mut self, size: usize) -> Self {
        self.default_size = size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_zero_on_rollback(mut self, enabled: bool) -> Self {
        self.zero_on_rollback = enabled;
        self
    }

    /// Page granularity actually used: never below the OS page size, always
    /// a power of two.
    pub fn effective_page_size(&self) -> usize {
        let os = os_page_size();
        self.page_size.max(os).next_power_of_two()
    }
}

/// Position of the bump pointer. Ordered: later allocations compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    page: usize,
    offset: usize,
}

impl Cursor {
    #[inline]
    pub fn page(&self) -> usize {
        self.page
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Allocation counters, saved and restored by snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocCounters {
    /// Bytes handed out, padding included.
    pub allocated: usize,
    pub mallocs: u64,
    pub reallocs: u64,
    pub frees: u64,
    /// Alignment padding plus abandoned page tails.
    pub bytes_wasted: usize,
    /// Allocations that needed padding to meet their alignment.
    pub alignment_mismatches: u64,
}

/// Point-in-time view of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub counters: AllocCounters,
    /// Bytes reserved from the OS across all pages.
    pub size: usize,
    pub pages: usize,
    /// Bytes left in the current page.
    pub remaining: usize,
    pub snapshots: usize,
}

/// Bump allocator owned by exactly one task or thread.
pub struct Arena {
    owner: OwnerId,
    config: ArenaConfig,
    page_size: usize,
    pages: Vec<Page>,
    current: usize,
    bump: Bump,
    counters: AllocCounters,
    snapshots: SnapshotSet,
}

impl Arena {
    /// Create an arena with its first page already reserved.
    pub fn new(config: ArenaConfig) -> Result<Self> {
        let page_size = config.effective_page_size();
        let owner = OwnerId::next();
        let first = round_up(config.default_size.max(1), page_size)
            .and_then(|size| Page::new(size, page_size))
            .ok_or(ArenaError::OutOfMemory {
                requested: config.default_size,
            })?;

        page_index().register(first.addr(), first.size(), owner);
        logging::log_page_grow(owner.get(), first.size(), 1);

        Ok(Self {
            owner,
            config,
            page_size,
            bump: Bump::new(first.size()),
            pages: vec![first],
            current: 0,
            counters: AllocCounters::default(),
            snapshots: SnapshotSet::new(),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(ArenaConfig::default())
    }

    #[inline]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    #[inline]
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn cursor(&self) -> Cursor {
        Cursor {
            page: self.current,
            offset: self.bump.offset(),
        }
    }

    #[inline]
    pub fn counters(&self) -> AllocCounters {
        self.counters
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            counters: self.counters,
            size: self.pages.iter().map(Page::size).sum(),
            pages: self.pages.len(),
            remaining: self.bump.remaining(),
            snapshots: self.snapshots.depth(),
        }
    }

    /// True when `ptr` falls inside one of this arena's pages.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.pages.iter().any(|p| p.contains(addr))
    }

    // ===== Allocation =====

    /// Allocate `size` zeroed bytes aligned to `max(align, MIN_ALIGN)`.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<Block> {
        if align == 0 || !align.is_power_of_two() {
            return Err(ArenaError::InvalidLayout { size, align });
        }
        let align = align.max(MIN_ALIGN);

        let base = self.pages[self.current].addr();
        let bumped = match self.bump.try_alloc(base, size, align) {
            Some(bumped) => bumped,
            None => self.alloc_slow(size, align)?,
        };

        self.counters.allocated += size + bumped.padding;
        self.counters.mallocs += 1;
        if bumped.padding > 0 {
            self.counters.bytes_wasted += bumped.padding;
            self.counters.alignment_mismatches += 1;
        }

        let page = &mut self.pages[self.current];
        if !self.config.zero_on_rollback {
            page.zero(bumped.start, bumped.start + size);
        }
        let ptr = unsafe { NonNull::new_unchecked(page.base().add(bumped.start)) };

        Ok(Block::new(ptr, size, self.snapshots.newest_id(), self.owner))
    }

    /// Allocate and fill a block with `data`.
    pub fn alloc_bytes(&mut self, data: &[u8]) -> Result<Block> {
        let block = self.allocate(data.len(), 1)?;
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), block.raw(), data.len()) };
        Ok(block)
    }

    /// Move to the next retained page that fits, or link a new one.
    fn alloc_slow(&mut self, size: usize, align: usize) -> Result<Bumped> {
        while self.current + 1 < self.pages.len() {
            self.counters.bytes_wasted += self.bump.remaining();
            self.current += 1;
            let page = &self.pages[self.current];
            self.bump.reset(0, page.size());
            if let Some(bumped) = self.bump.try_alloc(page.addr(), size, align) {
                return Ok(bumped);
            }
        }

        self.grow(size, align)?;
        let page = &self.pages[self.current];
        self.bump
            .try_alloc(page.addr(), size, align)
            .ok_or(ArenaError::OutOfMemory { requested: size })
    }

    fn grow(&mut self, size: usize, align: usize) -> Result<()> {
        let oom = ArenaError::OutOfMemory { requested: size };
        let want = size.checked_add(align).ok_or(ArenaError::InvalidLayout { size, align })?;
        let bytes = round_up(want.max(self.config.default_size), self.page_size).ok_or(oom.clone())?;

        let page = match Page::new(bytes, self.page_size) {
            Some(page) => page,
            None => {
                logging::log_out_of_memory(self.owner.get(), bytes);
                return Err(oom);
            }
        };

        page_index().register(page.addr(), page.size(), self.owner);
        self.counters.bytes_wasted += self.bump.remaining();
        self.bump.reset(0, page.size());
        self.pages.push(page);
        self.current = self.pages.len() - 1;

        logging::log_page_grow(self.owner.get(), bytes, self.pages.len());
        Ok(())
    }

    /// Copy-forward reallocation: a new block receives `min(old, new)` bytes.
    /// The old block stays where it is as dead space.
    pub fn reallocate(&mut self, block: &Block, new_size: usize) -> Result<Block> {
        self.check(block)?;
        let fresh = self.allocate(new_size, MIN_ALIGN)?;
        let n = block.len().min(new_size);
        unsafe { core::ptr::copy_nonoverlapping(block.as_ptr(), fresh.raw(), n) };
        self.counters.reallocs += 1;
        Ok(fresh)
    }

    /// Statistics only; no memory is reclaimed.
    pub fn free(&mut self, _block: &Block) {
        self.counters.frees += 1;
    }

    // ===== Block access =====

    pub fn bytes(&self, block: &Block) -> Result<&[u8]> {
        self.check(block)?;
        Ok(unsafe { core::slice::from_raw_parts(block.as_ptr(), block.len()) })
    }

    pub fn bytes_mut(&mut self, block: &Block) -> Result<&mut [u8]> {
        self.check(block)?;
        Ok(unsafe { core::slice::from_raw_parts_mut(block.raw(), block.len()) })
    }

    /// Copy as much of `data` as fits into `block`; returns bytes written.
    pub fn write(&mut self, block: &Block, data: &[u8]) -> Result<usize> {
        let dst = self.bytes_mut(block)?;
        let n = dst.len().min(data.len());
        dst[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Whether `block` may still be read through this arena.
    pub fn is_live(&self, block: &Block) -> bool {
        self.check(block).is_ok()
    }

    fn check(&self, block: &Block) -> Result<()> {
        if block.owner() != self.owner {
            return Err(ArenaError::ForeignBlock);
        }
        if !self.snapshots.is_live(block.scope()) {
            return Err(ArenaError::StaleBlock { scope: block.scope() });
        }
        Ok(())
    }

    // ===== Snapshots =====

    /// Open a checkpoint after `prev`, which must be the newest open one.
    pub fn take_snapshot(&mut self, prev: Option<&Snapshot>) -> Result<Snapshot> {
        let cursor = self.cursor();
        let result = self.snapshots.take(prev, cursor, self.counters);
        self.after_take(result)
    }

    /// Open a checkpoint after the newest one.
    pub fn snapshot(&mut self) -> Result<Snapshot> {
        let cursor = self.cursor();
        let result = self.snapshots.push(cursor, self.counters);
        self.after_take(result)
    }

    fn after_take(&self, result: Result<Snapshot>) -> Result<Snapshot> {
        match &result {
            Ok(snapshot) => {
                logging::log_snapshot_take(self.owner.get(), snapshot.id(), self.snapshots.depth())
            }
            Err(ArenaError::SnapshotsExhausted) => {
                logging::log_snapshots_exhausted(self.owner.get())
            }
            Err(_) => {}
        }
        result
    }

    /// Undo every allocation made since `snapshot` was taken.
    ///
    /// `snapshot` must be the newest open checkpoint; otherwise nothing changes
    /// and `SnapshotNotNewest` is returned.
    pub fn rollback(&mut self, snapshot: &Snapshot) -> Result<()> {
        let saved = self.snapshots.release(snapshot)?;
        self.restore(saved);
        Ok(())
    }

    /// Roll back every open checkpoint, newest first. Returns how many.
    pub fn reset_to_root(&mut self) -> usize {
        let mut count = 0;
        while let Some(saved) = self.snapshots.pop() {
            self.restore(saved);
            count += 1;
        }
        count
    }

    #[inline]
    pub fn snapshot_depth(&self) -> usize {
        self.snapshots.depth()
    }

    fn restore(&mut self, saved: SavedState) {
        let to = self.cursor();
        let from = saved.cursor;
        let reclaimed = self.counters.allocated.saturating_sub(saved.counters.allocated);

        if self.config.zero_on_rollback {
            self.zero_between(from, to);
        }

        self.current = from.page;
        self.bump.reset(from.offset, self.pages[from.page].size());
        self.counters = saved.counters;

        logging::log_rollback(self.owner.get(), saved.id, reclaimed);
    }

    fn zero_between(&mut self, from: Cursor, to: Cursor) {
        if to <= from {
            return;
        }
        for index in from.page..=to.page {
            let page = &mut self.pages[index];
            let start = if index == from.page { from.offset } else { 0 };
            let end = if index == to.page { to.offset } else { page.size() };
            page.zero(start, end);
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let index = page_index();
        for page in &self.pages {
            index.unregister(page.addr(), page.size());
        }
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("owner", &self.owner)
            .field("cursor", &self.cursor())
            .field("stats", &self.stats())
            .finish()
    }
}
