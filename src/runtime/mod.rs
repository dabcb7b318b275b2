//! Runtime coordinator
//!
//! Design: one explicitly constructed [`Runtime`] per worker pool. Workers,
//! the timer thread and the reactor share its state through an `Arc`; the
//! controlling thread drains the queues in [`Runtime::run_once`].

mod memory;
mod pump;
pub(crate) mod queues;
mod timers;
mod wake;
pub(crate) mod worker;

#[cfg(test)]
mod tests;

pub use memory::{FixedMemoryProbe, MemoryProbe, SystemMemoryProbe};
pub use timers::Event;

pub(crate) use timers::{Expiry, Scheduler};

use crate::config::RuntimeConfig;
use crate::context::{Callable, Task, TaskId, TaskKind, TaskState, Work};
use crate::errors::{PxError, Result};
use crate::metrics::{Counters, PerformanceMetrics, RuntimeStats, TimingStats, WorkKind};
use crate::net::NetShared;
use crate::value::{Args, Value};
use crossbeam::channel::{self, Sender};
use dashmap::DashMap;
use memory::MemoryMonitor;
use parking_lot::Mutex;
use pxengine_runtime::Arena;
use queues::{CallRequest, Queues};
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use wake::WakeSignal;
use worker::{FileWrite, Job};

#[cfg(target_os = "linux")]
use crate::net::{reactor::Reactor, server::Listener};
#[cfg(target_os = "linux")]
use once_cell::sync::OnceCell;

/// State shared by the controlling thread, workers, timers and the reactor.
pub(crate) struct Shared {
    pub config: RuntimeConfig,
    pub counters: Arc<Counters>,
    pub metrics: PerformanceMetrics,
    pub queues: Queues,
    pub wake: WakeSignal,
    pub memory: MemoryMonitor,
    pub jobs: Sender<Job>,
    pub registry: DashMap<TaskId, Arc<Task>>,
    /// Released tasks counting their ttl down; touched only by the pump.
    pub purge: Mutex<Vec<Arc<Task>>>,
    pub scheduler: Scheduler,
    pub net: NetShared,
    #[cfg(target_os = "linux")]
    pub reactor: OnceCell<Arc<Reactor>>,
    #[cfg(target_os = "linux")]
    pub listeners: Mutex<Vec<Arc<Listener>>>,
    controller: ThreadId,
    workers: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Shared {
    pub fn work_kind(&self, task: &Task) -> WorkKind {
        match task.kind() {
            TaskKind::Work => WorkKind::Work,
            TaskKind::Wait => WorkKind::Wait,
            TaskKind::Timer => WorkKind::Timer,
            TaskKind::FileWrite | TaskKind::Connection | TaskKind::Listener => WorkKind::Io,
        }
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            Err(PxError::Shutdown)
        } else {
            Ok(())
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Refuse new tasks while memory load is at or above the hard limit.
    pub fn admit(&self) -> Result<()> {
        self.ensure_running()?;
        if self.memory.above_hard() {
            let load = self.memory.load();
            tracing::warn!(target: "task", load, "task refused: memory load above hard limit");
            return Err(PxError::AllocationFailure(format!(
                "memory load {}% is at or above the hard limit of {}%",
                load, self.config.memory.hard_limit
            )));
        }
        Ok(())
    }

    pub fn new_arena(&self) -> Result<Arena> {
        Ok(Arena::new(self.config.task_arena())?)
    }

    /// Create and register a task; it holds its registration reference.
    pub fn create_task(&self, kind: TaskKind, arena: Option<Arena>) -> Result<Arc<Task>> {
        let task = Task::new(kind, self.config.pool.task_ttl, arena)?;
        self.registry.insert(task.id(), Arc::clone(&task));
        self.counters.tasks_created.fetch_add(1, Ordering::Relaxed);
        self.counters.tasks_active.fetch_add(1, Ordering::AcqRel);
        Ok(task)
    }

    pub fn create_work_task(&self, work: Work, kind: TaskKind) -> Result<Arc<Task>> {
        self.admit()?;
        let arena = self.new_arena()?;
        let task = self.create_task(kind, Some(arena))?;
        task.lock().work = Some(work);
        Ok(task)
    }

    /// Hand a task to the worker pool; the job holds one reference.
    pub fn dispatch(&self, task: Arc<Task>) {
        task.set_state(TaskState::Queued);
        task.incref();
        self.send_job(Job::Run(task));
    }

    pub fn send_job(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            tracing::error!(target: "worker", "job dropped: worker pool is gone");
        }
    }

    /// Drop one reference, releasing the task when none are left.
    pub fn decref(&self, task: &Arc<Task>) {
        if task.decref() == 0 {
            self.release(task);
        }
    }

    fn release(&self, task: &Arc<Task>) {
        let _guard = task.lifecycle();
        if task.persisted_count() > 0 {
            task.set_state(TaskState::Persisted);
            task.mark_persisted();
            self.counters.tasks_persisted.fetch_add(1, Ordering::AcqRel);
            self.counters.task_deactivated();
            tracing::debug!(target: "task", id = task.id().get(), "task persisted");
        } else {
            self.queues.purge_incoming.push(Arc::clone(task));
        }
    }

    /// Free a task's resources. Runs at most once per task.
    pub fn destroy(&self, task: &Arc<Task>) {
        if !task.mark_destroyed() {
            return;
        }
        task.set_state(TaskState::Destroyed);
        task.teardown();
        self.registry.remove(&task.id());
        self.counters.tasks_destroyed.fetch_add(1, Ordering::Relaxed);
        if !task.was_persisted() {
            self.counters.task_deactivated();
        }
        tracing::trace!(target: "task", id = task.id().get(), "task destroyed");
    }

    pub fn call_and_wait(&self, callable: Callable, args: Args) -> Result<Value> {
        self.ensure_running()?;
        if thread::current().id() == self.controller {
            return Err(PxError::violation(
                "blocking call into the controlling thread made from the controlling thread",
            ));
        }
        let (tx, rx) = flume::bounded(1);
        self.counters.kind(WorkKind::SyncWait).submit();
        self.queues.incoming.push(CallRequest {
            callable,
            args,
            reply: Some(tx),
        });
        self.wake.signal();
        match rx.recv_timeout(self.config.sync_wait_timeout()) {
            Ok(result) => result,
            Err(flume::RecvTimeoutError::Timeout) => Err(PxError::WaitTimeout),
            Err(flume::RecvTimeoutError::Disconnected) => Err(PxError::WaitAbandoned),
        }
    }

    /// Nothing submitted, running, alive, persisted or awaiting destruction.
    pub fn is_idle(&self) -> bool {
        self.counters.outstanding() == 0
            && self.counters.active() == 0
            && self.counters.persisted() == 0
            && self.queues.is_empty()
            && self.purge.lock().is_empty()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats::collect(&self.counters, self.workers, self.metrics.uptime())
    }

    #[cfg(target_os = "linux")]
    pub fn reactor(self: &Arc<Self>) -> Result<Arc<Reactor>> {
        let reactor = self.reactor.get_or_try_init(|| -> Result<Arc<Reactor>> {
            let reactor = Arc::new(Reactor::new().map_err(|e| PxError::io("epoll_create", e))?);
            let handle = crate::net::reactor::spawn(Arc::clone(self), Arc::clone(&reactor))
                .map_err(|e| PxError::io("spawn", e))?;
            self.threads.lock().push(handle);
            Ok(reactor)
        })?;
        Ok(Arc::clone(reactor))
    }

    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(target: "pump", "runtime shutting down");

        #[cfg(target_os = "linux")]
        if let Some(reactor) = self.reactor.get() {
            reactor.request_shutdown();
        }
        self.scheduler.stop();
        for _ in 0..self.workers {
            let _ = self.jobs.send(Job::Stop);
        }

        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        #[cfg(target_os = "linux")]
        self.listeners.lock().clear();
        self.scheduler.clear();
        while self.queues.incoming.pop().is_some() {}
        while self.queues.errors.pop().is_some() {}
        while self.queues.deferred_accepts.pop().is_some() {}
        for entry in self.registry.iter() {
            let task = entry.value();
            if task.state() == TaskState::Queued {
                self.counters.kind(self.work_kind(task)).abandon();
            }
            task.teardown();
        }
        self.registry.clear();
        self.purge.lock().clear();
    }
}

/// Configures and starts a [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.pool.workers = workers;
        self
    }

    /// Replace the `/proc/meminfo` sampler.
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Spawn the worker pool and timer thread. The calling thread becomes
    /// the controlling thread.
    pub fn build(self) -> Result<Runtime> {
        let config = self.config;
        config.validate()?;

        let probe = self.probe.unwrap_or_else(|| Arc::new(SystemMemoryProbe));
        let workers = config.worker_count();
        let counters = Arc::new(Counters::new());
        let (jobs, receiver) = channel::unbounded();

        let shared = Arc::new(Shared {
            memory: MemoryMonitor::new(probe, &config.memory),
            net: NetShared::new(Arc::clone(&counters), config.net.clone()),
            config,
            counters,
            metrics: PerformanceMetrics::new(),
            queues: Queues::new(),
            wake: WakeSignal::new(),
            jobs,
            registry: DashMap::new(),
            purge: Mutex::new(Vec::new()),
            scheduler: Scheduler::new(),
            #[cfg(target_os = "linux")]
            reactor: OnceCell::new(),
            #[cfg(target_os = "linux")]
            listeners: Mutex::new(Vec::new()),
            controller: thread::current().id(),
            workers,
            threads: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });
        shared.counters.memory_load.store(shared.memory.refresh(), Ordering::Relaxed);

        let runtime = Runtime {
            _guard: Arc::new(ShutdownGuard(Arc::clone(&shared))),
            shared: Arc::clone(&shared),
        };

        let mut handles = worker::spawn_workers(&shared, &receiver, workers)
            .map_err(|e| PxError::io("spawn", e))?;
        handles.push(
            shared
                .scheduler
                .spawn(shared.jobs.clone())
                .map_err(|e| PxError::io("spawn", e))?,
        );
        shared.threads.lock().extend(handles);

        tracing::info!(target: "pump", workers, "runtime started");
        Ok(runtime)
    }
}

struct ShutdownGuard(Arc<Shared>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Handle to a worker pool and its queues.
///
/// Clones share the same pool; the pool shuts down when the last clone is
/// dropped or [`Runtime::shutdown`] is called.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
    _guard: Arc<ShutdownGuard>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            config: RuntimeConfig::default(),
            probe: None,
        }
    }

    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(RuntimeConfig::default())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Queue `work` on the pool.
    ///
    /// Fails with `AllocationFailure` (registering nothing) while memory load
    /// is at or above the hard limit.
    pub fn submit(&self, work: Work) -> Result<TaskId> {
        let task = self.shared.create_work_task(work, TaskKind::Work)?;
        let id = task.id();
        self.shared.counters.kind(WorkKind::Work).submit();
        self.shared.dispatch(task);
        Ok(id)
    }

    /// Run `f(args)` on the controlling thread's pump and block for the result.
    ///
    /// Must be called from another thread; the pump must be running.
    pub fn submit_and_wait<F>(&self, f: F, args: impl Into<Args>) -> Result<Value>
    where
        F: Fn(&mut crate::WorkContext, &Args) -> Result<Value> + Send + Sync + 'static,
    {
        self.shared.call_and_wait(Arc::new(f), args.into())
    }

    /// Run `work` once `event` is set. After `timeout` the work's error path
    /// receives `WaitTimeout` instead.
    pub fn submit_wait(&self, event: &Event, timeout: Option<Duration>, work: Work) -> Result<TaskId> {
        let task = self.shared.create_work_task(work, TaskKind::Wait)?;
        let id = task.id();
        self.shared.counters.kind(WorkKind::Wait).submit();
        task.set_state(TaskState::Queued);
        task.incref();
        task.arm();
        let deadline = timeout.map(|timeout| {
            self.shared.scheduler.schedule(
                Instant::now() + timeout,
                Arc::clone(&task),
                Expiry::Expire(event.clone()),
            );
            self.shared.scheduler.clone()
        });
        event.add_waiter(task, self.shared.jobs.clone(), deadline);
        Ok(id)
    }

    /// Run `work` after `delay`.
    pub fn submit_timer(&self, delay: Duration, work: Work) -> Result<TaskId> {
        let task = self.shared.create_work_task(work, TaskKind::Timer)?;
        let id = task.id();
        self.shared.counters.kind(WorkKind::Timer).submit();
        task.set_state(TaskState::Queued);
        task.incref();
        task.arm();
        self.shared
            .scheduler
            .schedule(Instant::now() + delay, task, Expiry::Run);
        Ok(id)
    }

    /// Write `bytes` to `file` on the pool, then run `work` with the number of
    /// bytes written prepended to its arguments.
    ///
    /// The bytes are copied into the task's arena before this returns, so the
    /// caller's buffer may be reused at once. A failed write skips the
    /// callable and reaches the work's error path.
    pub fn submit_write_io(&self, file: &File, bytes: &[u8], work: Work) -> Result<TaskId> {
        let file = file.try_clone().map_err(|e| PxError::io("dup", e))?;
        let task = self.shared.create_work_task(work, TaskKind::FileWrite)?;
        let copied = task.lock().arena.as_mut().map(|arena| arena.alloc_bytes(bytes));
        let block = match copied {
            Some(Ok(block)) => block,
            Some(Err(err)) => {
                self.shared.decref(&task);
                return Err(err.into());
            }
            None => {
                self.shared.decref(&task);
                return Err(PxError::violation(format!("{} has no arena", task.id())));
            }
        };

        let id = task.id();
        self.shared.counters.kind(WorkKind::Io).submit();
        task.set_state(TaskState::Queued);
        task.incref();
        tracing::trace!(target: "task", id = id.get(), len = bytes.len(), "file write queued");
        self.shared.send_job(Job::Write(task, FileWrite { file, block }));
        Ok(id)
    }

    /// One pump cycle: purge, drain completions, raise at most one error.
    pub fn run_once(&self) -> Result<()> {
        pump::run_once(&self.shared)
    }

    /// Pump until no task is alive.
    pub fn run(&self) -> Result<()> {
        while self.shared.counters.active() > 0 {
            self.run_once()?;
        }
        Ok(())
    }

    /// Pump until `done` returns true or `timeout` passes; true if `done` was met.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut(&Runtime) -> bool) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while !done(self) {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            match self.run_once() {
                Ok(()) | Err(PxError::RunWithoutEvents) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }

    /// Timing percentiles for `"task"` executions or `"pump"` cycles.
    pub fn timing(&self, name: &str) -> Option<TimingStats> {
        self.shared.metrics.get_timing_stats(name)
    }

    /// Look up a task that has not been destroyed yet.
    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.shared.registry.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn memory_load(&self) -> u8 {
        self.shared.memory.load()
    }

    /// Sample memory load now instead of at the next pump cycle.
    pub fn refresh_memory_load(&self) -> u8 {
        let load = self.shared.memory.refresh();
        self.shared.counters.memory_load.store(load, Ordering::Relaxed);
        load
    }

    /// Stop the pool, join its threads and drop every task.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.shared.workers)
            .field("active", &self.shared.counters.active())
            .finish()
    }
}
