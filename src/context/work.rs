//! Work units and the context a running callable sees

use super::persist::Persisted;
use super::task::{Task, TaskId};
use crate::errors::{PxError, Result};
use crate::metrics::{RuntimeStats, WorkKind};
use crate::runtime::queues::CallRequest;
use crate::runtime::Shared;
use crate::value::{Args, Value};
use pxengine_runtime::{tls, Block, ROOT_SCOPE};
use std::fmt;
use std::sync::Arc;

/// A callable run on a worker (or on the pump for main-thread calls).
pub type Callable = Arc<dyn Fn(&mut WorkContext, &Args) -> Result<Value> + Send + Sync>;

/// Continuation receiving the callable's result.
pub type OnSuccess = Box<dyn FnOnce(&mut WorkContext, Value) -> Result<()> + Send>;

/// Continuation receiving the callable's (or the success continuation's) error.
pub type OnError = Box<dyn FnOnce(&mut WorkContext, &PxError) -> Result<()> + Send>;

/// Callable, arguments and continuations for one task.
pub struct Work {
    pub(crate) callable: Callable,
    pub(crate) args: Args,
    pub(crate) on_success: Option<OnSuccess>,
    pub(crate) on_error: Option<OnError>,
}

impl Work {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut WorkContext, &Args) -> Result<Value> + Send + Sync + 'static,
    {
        Self::from_callable(Arc::new(f))
    }

    pub fn from_callable(callable: Callable) -> Self {
        Self {
            callable,
            args: Args::default(),
            on_success: None,
            on_error: None,
        }
    }

    pub fn with_args(mut self, args: impl Into<Args>) -> Self {
        self.args = args.into();
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut WorkContext, Value) -> Result<()> + Send + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut WorkContext, &PxError) -> Result<()> + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("args", &self.args)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Handle given to callables and continuations.
///
/// Allocation helpers route to the running task's arena (or the calling
/// thread's heap for main-thread calls).
pub struct WorkContext {
    shared: Arc<Shared>,
    task: Option<Arc<Task>>,
}

impl WorkContext {
    pub(crate) fn new(shared: Arc<Shared>, task: Option<Arc<Task>>) -> Self {
        Self { shared, task }
    }

    /// Id of the running task; `None` for calls executed by the pump.
    pub fn task_id(&self) -> Option<TaskId> {
        self.task.as_ref().map(|t| t.id())
    }

    pub fn alloc(&self, size: usize, align: usize) -> Result<Block> {
        Ok(tls::alloc(size, align)?)
    }

    pub fn alloc_bytes(&self, data: &[u8]) -> Result<Block> {
        Ok(tls::alloc_bytes(data)?)
    }

    pub fn read(&self, block: &Block) -> Result<Vec<u8>> {
        Ok(tls::read(block)?)
    }

    /// Keep `block` readable after this task finishes.
    ///
    /// The task is retained (state `Persisted`) until every clone of the
    /// returned handle is dropped.
    pub fn persist(&self, block: &Block) -> Result<Persisted> {
        let task = self
            .task
            .as_ref()
            .ok_or_else(|| PxError::violation("persist called outside a task"))?;
        if block.scope() != ROOT_SCOPE && block.scope() != task.root_scope() {
            return Err(PxError::violation(format!(
                "block from snapshot scope {} cannot be persisted",
                block.scope()
            )));
        }
        let live = tls::with_active(|arena| arena.owner() == block.owner() && arena.is_live(block))?;
        if !live {
            return Err(PxError::violation("block does not belong to the running task"));
        }
        Ok(Persisted::new(
            Arc::clone(task),
            *block,
            Arc::clone(&self.shared.queues.released),
        ))
    }

    /// Queue nested work; the pump dispatches it on its next cycle.
    pub fn submit(&self, work: Work) -> Result<TaskId> {
        let task = self.shared.create_work_task(work, super::TaskKind::Work)?;
        let id = task.id();
        self.shared.counters.kind(WorkKind::Work).submit();
        self.shared.queues.new_work.push(task);
        self.shared.wake.signal();
        Ok(id)
    }

    /// Have the pump run `f(args)` without waiting for it.
    ///
    /// An error from `f` is raised by the pump; a non-`None` result is ignored.
    pub fn call_from_main_thread<F>(&self, f: F, args: impl Into<Args>) -> Result<()>
    where
        F: Fn(&mut WorkContext, &Args) -> Result<Value> + Send + Sync + 'static,
    {
        self.shared.ensure_running()?;
        self.shared.counters.kind(WorkKind::SyncNoWait).submit();
        self.shared.queues.incoming.push(CallRequest {
            callable: Arc::new(f),
            args: args.into(),
            reply: None,
        });
        self.shared.wake.signal();
        Ok(())
    }

    /// Have the pump run `f(args)` and block for its result.
    pub fn call_from_main_thread_and_wait<F>(&self, f: F, args: impl Into<Args>) -> Result<Value>
    where
        F: Fn(&mut WorkContext, &Args) -> Result<Value> + Send + Sync + 'static,
    {
        self.shared.call_and_wait(Arc::new(f), args.into())
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }
}
