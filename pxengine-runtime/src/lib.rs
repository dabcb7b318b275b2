//! pxengine runtime - per-task memory for the parallel task engine
//!
//! This crate provides the arena allocator every task allocates from, the
//! snapshot checkpoint/rollback layered on it, the per-thread heap used
//! outside any task, and the process-wide page-ownership index.

pub mod allocator;
pub mod error;
pub mod logging;

// Re-export core types
pub use allocator::{
    page_index, tls, AllocCounters, Arena, ArenaConfig, ArenaStats, Block, Cursor, OwnerId,
    PageIndex, Snapshot, ROOT_SCOPE,
};
pub use error::ArenaError;
