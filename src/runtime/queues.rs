//! Lock-free queues drained by the pump

use crate::context::{Callable, Task};
use crate::errors::{PxError, Result};
use crate::value::{Args, Value};
use crossbeam::queue::SegQueue;
use std::sync::Arc;

/// A callable the pump runs on the controlling thread.
pub(crate) struct CallRequest {
    pub callable: Callable,
    pub args: Args,
    /// Present for blocking calls.
    pub reply: Option<flume::Sender<Result<Value>>>,
}

/// An error waiting to be raised by `run_once`.
pub(crate) struct ErrorEntry {
    pub task: Option<Arc<Task>>,
    pub error: PxError,
}

#[derive(Default)]
pub(crate) struct Queues {
    pub incoming: SegQueue<CallRequest>,
    pub finished: SegQueue<Arc<Task>>,
    pub completed_callbacks: SegQueue<Arc<Task>>,
    pub completed_errbacks: SegQueue<Arc<Task>>,
    /// Raised one per `run_once`, oldest first.
    pub errors: SegQueue<ErrorEntry>,
    pub new_work: SegQueue<Arc<Task>>,
    /// Tasks whose last reference was dropped.
    pub purge_incoming: SegQueue<Arc<Task>>,
    /// Persisted tasks whose last external handle was dropped.
    pub released: Arc<SegQueue<Arc<Task>>>,
    /// Pooled connections waiting for memory load to drop.
    pub deferred_accepts: SegQueue<Arc<Task>>,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is waiting for the pump.
    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty()
            && self.finished.is_empty()
            && self.completed_callbacks.is_empty()
            && self.completed_errbacks.is_empty()
            && self.errors.is_empty()
            && self.new_work.is_empty()
            && self.purge_incoming.is_empty()
            && self.released.is_empty()
    }

    pub fn push_error(&self, task: Option<Arc<Task>>, error: PxError) {
        self.errors.push(ErrorEntry { task, error });
    }
}
