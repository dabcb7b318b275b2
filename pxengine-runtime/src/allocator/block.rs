//! Arena block handles
//!
//! Design: a block is an address token plus the arena and snapshot scope it
//! was carved from. It never dereferences on its own; the owning arena
//! checks owner and scope before handing out a slice.

use super::pages::OwnerId;
use core::ptr::NonNull;

/// Scope of blocks allocated while no snapshot is open.
pub const ROOT_SCOPE: u64 = 0;

/// Handle to bytes allocated from an [`Arena`](super::Arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    ptr: NonNull<u8>,
    len: usize,
    scope: u64,
    owner: OwnerId,
}

// A block is an inert token; access goes through the owning arena.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    #[inline]
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, scope: u64, owner: OwnerId) -> Self {
        Self { ptr, len, scope, owner }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Snapshot id the block was allocated under (0 for root).
    #[inline]
    pub fn scope(&self) -> u64 {
        self.scope
    }

    #[inline]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The first `len` bytes of this block (clamped to its length).
    pub fn prefix(&self, len: usize) -> Block {
        Block { len: len.min(self.len), ..*self }
    }

    /// True when the two blocks share no byte.
    pub fn is_disjoint(&self, other: &Block) -> bool {
        self.addr() + self.len <= other.addr() || other.addr() + other.len <= self.addr()
    }

    #[inline]
    pub(crate) fn raw(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}
