//! Worker pool
//!
//! Workers pull jobs from one crossbeam channel. A work task runs with its
//! arena installed as the thread's active arena; connection steps are driven
//! by the net module under the task's lock.

use super::Shared;
use crate::context::{Task, TaskState, Work, WorkContext};
use crate::errors::PxError;
use crate::metrics::Timer;
use crate::value::Value;
use crossbeam::channel::Receiver;
use pxengine_runtime::{tls, Block};
use std::fs::File;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[cfg(target_os = "linux")]
use crate::net::{driver, server::Listener, Entry};
#[cfg(target_os = "linux")]
use std::net::SocketAddr;

pub(crate) enum Job {
    /// Run a work, wait or timer task.
    Run(Arc<Task>),
    /// Run a wait task's error path with `WaitTimeout`.
    Expire(Arc<Task>),
    /// Write a task's copied bytes to a file, then run its work.
    Write(Arc<Task>, FileWrite),
    /// Advance a connection's state machine.
    #[cfg(target_os = "linux")]
    Io(Arc<Task>, Entry),
    /// Accept pending connections on a listener.
    #[cfg(target_os = "linux")]
    Accept(Arc<Listener>),
    /// Open a client connection.
    #[cfg(target_os = "linux")]
    Connect(Arc<Task>, SocketAddr),
    Stop,
}

/// A file handle and the arena block holding the bytes to write to it.
pub(crate) struct FileWrite {
    pub file: File,
    pub block: Block,
}

impl FileWrite {
    /// Write the whole block at the file's current offset. Runs with the
    /// owning task's arena active.
    fn perform(&self) -> crate::Result<usize> {
        let mut file = &self.file;
        tls::with_active(|arena| -> crate::Result<usize> {
            let data = arena.bytes(&self.block)?;
            file.write_all(data).map_err(|e| PxError::io("write", e))?;
            Ok(data.len())
        })?
    }
}

/// What a dispatched task does before its continuations run.
pub(crate) enum Step {
    Call,
    Expired(PxError),
    Write(FileWrite),
}

pub(crate) fn spawn_workers(
    shared: &Arc<Shared>,
    jobs: &Receiver<Job>,
    count: usize,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|index| {
            let shared = Arc::clone(shared);
            let jobs = jobs.clone();
            thread::Builder::new()
                .name(format!("pxengine-worker-{}", index))
                .spawn(move || worker_loop(shared, jobs, index))
        })
        .collect()
}

fn worker_loop(shared: Arc<Shared>, jobs: Receiver<Job>, index: usize) {
    tls::configure_tls_heap(shared.config.tls_arena());
    tracing::debug!(target: "worker", index, "worker started");

    while let Ok(job) = jobs.recv() {
        match job {
            Job::Stop => break,
            Job::Run(task) => execute(&shared, task, Step::Call),
            Job::Expire(task) => execute(&shared, task, Step::Expired(PxError::WaitTimeout)),
            Job::Write(task, write) => execute(&shared, task, Step::Write(write)),
            #[cfg(target_os = "linux")]
            Job::Io(task, entry) => driver::drive(&shared, task, entry),
            #[cfg(target_os = "linux")]
            Job::Accept(listener) => driver::accept(&shared, &listener),
            #[cfg(target_os = "linux")]
            Job::Connect(task, addr) => driver::connect(&shared, task, addr),
        }
    }

    tls::release_tls_heap();
    tracing::debug!(target: "worker", index, "worker stopped");
}

enum Completion {
    Callback,
    Errback,
    Unhandled(PxError),
}

/// Run a task's work with its arena active, then route it to the queue
/// matching how it ended.
pub(crate) fn execute(shared: &Arc<Shared>, task: Arc<Task>, step: Step) {
    let counters = shared.counters.kind(shared.work_kind(&task));
    counters.start();
    task.set_state(TaskState::Running);

    let (arena, work) = {
        let mut inner = task.lock();
        (inner.arena.take(), inner.work.take())
    };

    let completion = match (arena, work) {
        (Some(mut arena), Some(work)) => {
            let mut ctx = WorkContext::new(Arc::clone(shared), Some(Arc::clone(&task)));
            let completion = {
                let _timer = Timer::new(&shared.metrics, "task");
                tls::scoped(&mut arena, || run_work(&mut ctx, work, step))
            };
            task.lock().arena = Some(arena);
            completion
        }
        (arena, _) => {
            task.lock().arena = arena;
            Completion::Unhandled(PxError::violation(format!("{} has no work to run", task.id())))
        }
    };

    match completion {
        Completion::Callback => {
            task.set_state(TaskState::Completed);
            counters.finish(false);
            shared.queues.completed_callbacks.push(Arc::clone(&task));
        }
        Completion::Errback => {
            task.set_state(TaskState::Errored);
            counters.finish(true);
            shared.queues.completed_errbacks.push(Arc::clone(&task));
        }
        Completion::Unhandled(error) => {
            tracing::debug!(target: "worker", id = task.id().get(), %error, "task failed");
            task.set_state(TaskState::Errored);
            counters.finish(true);
            shared.queues.push_error(Some(Arc::clone(&task)), error);
        }
    }

    shared.wake.signal();
    shared.decref(&task);
}

fn run_work(ctx: &mut WorkContext, work: Work, step: Step) -> Completion {
    let Work {
        callable,
        args,
        on_success,
        on_error,
    } = work;

    let result = match step {
        Step::Call => guarded(|| callable(ctx, &args)),
        Step::Expired(err) => Err(err),
        Step::Write(write) => match write.perform() {
            Ok(written) => {
                tracing::trace!(target: "worker", written, "file write completed");
                let mut args = args;
                args.positional.insert(0, Value::Int(written as i64));
                guarded(|| callable(ctx, &args))
            }
            Err(err) => Err(err),
        },
    };

    let failure = match result {
        Ok(value) => match on_success {
            None => return Completion::Callback,
            Some(cb) => match guarded(|| cb(ctx, value)) {
                Ok(()) => return Completion::Callback,
                Err(err) => err,
            },
        },
        Err(err) => err,
    };

    match on_error {
        None => Completion::Unhandled(failure),
        Some(eb) => match guarded(|| eb(ctx, &failure)) {
            Ok(()) => Completion::Errback,
            Err(err) => Completion::Unhandled(err),
        },
    }
}

/// Turn a panic in user code into a callback error.
fn guarded<T>(f: impl FnOnce() -> crate::Result<T>) -> crate::Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked".to_string());
        Err(PxError::Callback(message))
    })
}
