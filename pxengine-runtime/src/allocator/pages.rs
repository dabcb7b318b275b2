//! Process-wide page ownership index
//!
//! Design: every arena page is registered granule by granule in a sharded
//! `DashMap`, so "which arena owns this address" is a single lookup with no
//! global lock.

use super::page::os_page_size;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one arena for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Allocate a fresh, never reused identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Maps page-granule addresses to the arena that owns them.
pub struct PageIndex {
    granule: usize,
    owners: DashMap<usize, OwnerId>,
}

impl PageIndex {
    pub fn new(granule: usize) -> Self {
        debug_assert!(granule.is_power_of_two());
        Self {
            granule,
            owners: DashMap::new(),
        }
    }

    #[inline]
    pub fn granule(&self) -> usize {
        self.granule
    }

    pub(crate) fn register(&self, start: usize, len: usize, owner: OwnerId) {
        for key in self.granules(start, len) {
            let previous = self.owners.insert(key, owner);
            debug_assert!(previous.is_none(), "page granule registered twice");
        }
    }

    pub(crate) fn unregister(&self, start: usize, len: usize) {
        for key in self.granules(start, len) {
            self.owners.remove(&key);
        }
    }

    /// Which arena owns `ptr`, if any.
    pub fn owner_of(&self, ptr: *const u8) -> Option<OwnerId> {
        let key = ptr as usize & !(self.granule - 1);
        self.owners.get(&key).map(|entry| *entry.value())
    }

    /// Number of registered granules.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    fn granules(&self, start: usize, len: usize) -> impl Iterator<Item = usize> {
        let first = start & !(self.granule - 1);
        let end = start + len;
        (first..end).step_by(self.granule)
    }
}

static PAGE_INDEX: Lazy<PageIndex> = Lazy::new(|| PageIndex::new(os_page_size()));

/// The index every arena registers its pages with.
pub fn page_index() -> &'static PageIndex {
    &PAGE_INDEX
}
