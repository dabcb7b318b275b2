//! Allocator errors

use std::fmt;

/// Failure raised by an [`Arena`](crate::allocator::Arena) or its snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// The OS refused to back a new page.
    OutOfMemory { requested: usize },
    /// Zero or non power-of-two alignment, or a size that overflows.
    InvalidLayout { size: usize, align: usize },
    /// Every snapshot slot is in use.
    SnapshotsExhausted,
    /// A snapshot other than the newest outstanding one was named.
    SnapshotNotNewest { id: u64, newest: u64 },
    /// The snapshot was already rolled back or belongs to another arena.
    UnknownSnapshot { id: u64 },
    /// The block was allocated under a snapshot that has since been rolled back.
    StaleBlock { scope: u64 },
    /// The block belongs to a different arena.
    ForeignBlock,
    /// The thread's active arena is already borrowed.
    Busy,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: cannot grow arena by {} bytes", requested)
            }
            Self::InvalidLayout { size, align } => {
                write!(f, "Invalid layout: size {} with alignment {}", size, align)
            }
            Self::SnapshotsExhausted => write!(f, "No free snapshot slots"),
            Self::SnapshotNotNewest { id, newest } => {
                write!(f, "Snapshot {} is not the newest outstanding snapshot ({})", id, newest)
            }
            Self::UnknownSnapshot { id } => write!(f, "Unknown snapshot {}", id),
            Self::StaleBlock { scope } => {
                write!(f, "Block scope {} was rolled back", scope)
            }
            Self::ForeignBlock => write!(f, "Block belongs to another arena"),
            Self::Busy => write!(f, "Active arena is already borrowed on this thread"),
        }
    }
}

impl std::error::Error for ArenaError {}

pub type Result<T> = std::result::Result<T, ArenaError>;
