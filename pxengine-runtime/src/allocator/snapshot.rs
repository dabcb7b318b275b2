//! Snapshot bookkeeping
//!
//! Design: a fixed pool of slots (one per bit of a pointer) with a free
//! bitmap; the lowest free bit wins. Open snapshots form one strict chain,
//! oldest to newest, and only the newest may be rolled back.

use super::arena::{AllocCounters, Cursor};
use super::block::ROOT_SCOPE;
use crate::error::{ArenaError, Result};
use smallvec::SmallVec;

/// Slots available per arena.
pub const MAX_SNAPSHOTS: usize = usize::BITS as usize;

/// Handle to an open checkpoint. Not `Clone`: one handle per checkpoint.
#[derive(Debug, PartialEq, Eq)]
pub struct Snapshot {
    slot: u8,
    id: u64,
}

impl Snapshot {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn slot(&self) -> u8 {
        self.slot
    }
}

/// Saved arena state held in a slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SavedState {
    pub id: u64,
    pub cursor: Cursor,
    pub counters: AllocCounters,
}

pub(crate) struct SnapshotSet {
    slots: [Option<SavedState>; MAX_SNAPSHOTS],
    free: usize,
    chain: SmallVec<[u8; 4]>,
    next_id: u64,
}

impl SnapshotSet {
    pub(crate) fn new() -> Self {
        Self {
            slots: [None; MAX_SNAPSHOTS],
            free: usize::MAX,
            chain: SmallVec::new(),
            next_id: ROOT_SCOPE + 1,
        }
    }

    /// Open a snapshot after `prev`, which must be the newest (or `None` on an
    /// empty chain).
    pub(crate) fn take(
        &mut self,
        prev: Option<&Snapshot>,
        cursor: Cursor,
        counters: AllocCounters,
    ) -> Result<Snapshot> {
        let newest = self.newest_id();
        let requested = prev.map_or(ROOT_SCOPE, Snapshot::id);
        if requested != newest {
            return Err(ArenaError::SnapshotNotNewest { id: requested, newest });
        }
        self.push(cursor, counters)
    }

    /// Open a snapshot after whatever is newest.
    pub(crate) fn push(&mut self, cursor: Cursor, counters: AllocCounters) -> Result<Snapshot> {
        if self.free == 0 {
            return Err(ArenaError::SnapshotsExhausted);
        }
        let slot = self.free.trailing_zeros() as u8;
        self.free &= !(1usize << slot);

        let id = self.next_id;
        self.next_id += 1;
        self.slots[slot as usize] = Some(SavedState { id, cursor, counters });
        self.chain.push(slot);

        Ok(Snapshot { slot, id })
    }

    /// Close `snapshot`, which must be the newest. No state changes on error.
    pub(crate) fn release(&mut self, snapshot: &Snapshot) -> Result<SavedState> {
        let known = self
            .slots
            .get(snapshot.slot as usize)
            .and_then(|s| s.as_ref())
            .map_or(false, |s| s.id == snapshot.id);
        if !known {
            return Err(ArenaError::UnknownSnapshot { id: snapshot.id });
        }

        let newest = self.newest_id();
        if newest != snapshot.id {
            return Err(ArenaError::SnapshotNotNewest { id: snapshot.id, newest });
        }

        self.pop().ok_or(ArenaError::UnknownSnapshot { id: snapshot.id })
    }

    /// Close the newest snapshot, whatever it is.
    pub(crate) fn pop(&mut self) -> Option<SavedState> {
        let slot = self.chain.pop()?;
        self.free |= 1usize << slot;
        self.slots[slot as usize].take()
    }

    /// Scope new blocks are tagged with.
    #[inline]
    pub(crate) fn newest_id(&self) -> u64 {
        self.chain
            .last()
            .and_then(|&slot| self.slots[slot as usize].as_ref())
            .map_or(ROOT_SCOPE, |s| s.id)
    }

    pub(crate) fn is_live(&self, scope: u64) -> bool {
        scope == ROOT_SCOPE
            || self
                .chain
                .iter()
                .any(|&slot| self.slots[slot as usize].map_or(false, |s| s.id == scope))
    }

    #[inline]
    pub(crate) fn depth(&self) -> usize {
        self.chain.len()
    }
}
