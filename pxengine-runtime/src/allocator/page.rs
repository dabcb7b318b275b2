//! OS memory acquisition
//!
//! Design: one zeroed, page-aligned region per arena page, returned to the
//! system allocator on drop. Pages are never resized.

use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// One contiguous region backing part of an arena.
pub(crate) struct Page {
    start: NonNull<u8>,
    layout: Layout,
}

// The region is only reached through the owning arena.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Acquire a zeroed region of `size` bytes aligned to `align`.
    pub(crate) fn new(size: usize, align: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        let start = unsafe { alloc_zeroed(layout) };
        NonNull::new(start).map(|start| Self { start, layout })
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self.start.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.addr() + self.size()
    }

    /// Zero `[from, to)` within this page.
    pub(crate) fn zero(&mut self, from: usize, to: usize) {
        debug_assert!(from <= to && to <= self.size(), "zero range out of page");
        if from < to {
            unsafe { core::ptr::write_bytes(self.base().add(from), 0, to - from) };
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { dealloc(self.start.as_ptr(), self.layout) };
    }
}

/// Granularity of OS pages on this machine.
pub fn os_page_size() -> usize {
    #[cfg(unix)]
    {
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n > 0 {
            return n as usize;
        }
    }
    FALLBACK_PAGE_SIZE
}

/// Round `n` up to a multiple of `granule`. `None` on overflow.
#[inline]
pub(crate) fn round_up(n: usize, granule: usize) -> Option<usize> {
    debug_assert!(granule > 0);
    n.checked_add(granule - 1).map(|v| v / granule * granule)
}
