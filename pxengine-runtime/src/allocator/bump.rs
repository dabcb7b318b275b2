//! Bump pointer allocation - O(1) fast path
//!
//! Design: offsets into the current page rather than raw pointers, so the
//! position can be saved into a snapshot and restored verbatim.

/// Bump state over a single page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bump {
    offset: usize,
    limit: usize,
}

/// A successful bump: where the block starts and how much padding preceded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bumped {
    pub start: usize,
    pub padding: usize,
}

impl Bump {
    #[inline]
    pub(crate) const fn new(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    /// Fast path: align against the page's real address, then bump.
    ///
    /// Returns None if the page is exhausted (caller handles slow path).
    #[inline(always)]
    pub(crate) fn try_alloc(&mut self, base: usize, size: usize, align: usize) -> Option<Bumped> {
        debug_assert!(align.is_power_of_two(), "alignment must be power of 2");

        let here = base.checked_add(self.offset)?;
        let start = align_up(here, align)?.checked_sub(base)?;
        let end = start.checked_add(size)?;

        if end <= self.limit {
            let padding = start - self.offset;
            self.offset = end;
            Some(Bumped { start, padding })
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self, offset: usize, limit: usize) {
        debug_assert!(offset <= limit, "invalid page bounds");
        self.offset = offset;
        self.limit = limit;
    }

    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.offset)
    }
}

/// Align address upward to next multiple of alignment
#[inline(always)]
pub(crate) fn align_up(addr: usize, align: usize) -> Option<usize> {
    addr.checked_add(align - 1).map(|v| v & !(align - 1))
}
