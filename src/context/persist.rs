//! Values that outlive the task that allocated them

use super::task::{Task, TaskId, TaskState};
use crate::errors::{PxError, Result};
use crossbeam::queue::SegQueue;
use pxengine_runtime::{tls, Block};
use std::fmt;
use std::sync::Arc;

/// A block kept readable after its task finished.
///
/// Each clone counts as one external reference; the owning task is destroyed
/// once it has finished and the last clone is dropped.
pub struct Persisted {
    task: Arc<Task>,
    block: Block,
    released: Arc<SegQueue<Arc<Task>>>,
}

impl Persisted {
    pub(crate) fn new(task: Arc<Task>, block: Block, released: Arc<SegQueue<Arc<Task>>>) -> Self {
        {
            let _guard = task.lifecycle();
            task.add_persisted();
        }
        Self {
            task,
            block,
            released,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn block(&self) -> Block {
        self.block
    }

    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    /// Copy the value out of the owning arena.
    pub fn read(&self) -> Result<Vec<u8>> {
        {
            let inner = self.task.lock();
            if let Some(arena) = inner.arena.as_ref() {
                return Ok(arena.bytes(&self.block)?.to_vec());
            }
        }
        // The owner is executing; only its own thread can see the arena.
        tls::read(&self.block).map_err(|_| {
            PxError::violation(format!("{} is busy on another thread", self.task.id()))
        })
    }
}

impl Clone for Persisted {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.task), self.block, Arc::clone(&self.released))
    }
}

impl Drop for Persisted {
    fn drop(&mut self) {
        let _guard = self.task.lifecycle();
        if self.task.remove_persisted() == 0 && self.task.state() == TaskState::Persisted {
            self.released.push(Arc::clone(&self.task));
        }
    }
}

impl fmt::Debug for Persisted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persisted")
            .field("task", &self.task.id())
            .field("len", &self.block.len())
            .finish()
    }
}
