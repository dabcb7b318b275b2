//! The single-threaded pump

use super::queues::CallRequest;
use super::Shared;
use crate::context::{TaskState, WorkContext};
use crate::errors::{PxError, Result};
use crate::metrics::{Timer, WorkKind};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// One pump cycle.
///
/// Raises at most one deferred error, oldest first. Returns once something
/// was processed, nothing is alive, or the wake signal timed out.
pub(crate) fn run_once(shared: &Arc<Shared>) -> Result<()> {
    shared.ensure_running()?;
    let _timer = Timer::new(&shared.metrics, "pump");

    let load = shared.memory.refresh();
    shared.counters.memory_load.store(load, Ordering::Relaxed);

    if shared.is_idle() {
        return Err(PxError::RunWithoutEvents);
    }

    loop {
        let mut progress = purge(shared);
        progress += drain_released(shared);
        progress += drain_finished(shared);

        if let Some(entry) = shared.queues.errors.pop() {
            if let Some(task) = entry.task {
                shared.queues.finished.push(task);
            }
            shared.counters.errors_raised.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target: "pump", error = %entry.error, "raising deferred error");
            return Err(entry.error);
        }

        progress += dispatch_new_work(shared);
        progress += process_incoming(shared);
        progress += drain_completed(shared);

        #[cfg(target_os = "linux")]
        {
            progress += crate::net::server::housekeeping(shared);
        }

        if progress > 0 || shared.counters.active() == 0 {
            return Ok(());
        }
        if !shared.wake.wait(shared.config.wake_timeout()) {
            return Ok(());
        }
    }
}

/// Count released tasks down; destroy those whose ttl is spent.
fn purge(shared: &Shared) -> usize {
    let mut purge = shared.purge.lock();
    let mut progress = 0;

    purge.retain(|task| {
        progress += 1;
        if task.tick_ttl() {
            true
        } else {
            shared.destroy(task);
            false
        }
    });

    while let Some(task) = shared.queues.purge_incoming.pop() {
        purge.push(task);
        progress += 1;
    }
    progress
}

fn drain_released(shared: &Shared) -> usize {
    let mut count = 0;
    while let Some(task) = shared.queues.released.pop() {
        shared.counters.persisted_released();
        shared.queues.purge_incoming.push(task);
        count += 1;
    }
    count
}

fn drain_finished(shared: &Shared) -> usize {
    let mut count = 0;
    while let Some(task) = shared.queues.finished.pop() {
        task.set_state(TaskState::Finished);
        shared.decref(&task);
        count += 1;
    }
    count
}

fn dispatch_new_work(shared: &Shared) -> usize {
    let mut count = 0;
    while let Some(task) = shared.queues.new_work.pop() {
        shared.dispatch(task);
        count += 1;
    }
    count
}

fn drain_completed(shared: &Shared) -> usize {
    let mut count = 0;
    while let Some(task) = shared.queues.completed_callbacks.pop() {
        shared.counters.callbacks_completed.fetch_add(1, Ordering::Relaxed);
        shared.queues.finished.push(task);
        count += 1;
    }
    while let Some(task) = shared.queues.completed_errbacks.pop() {
        shared.counters.errbacks_completed.fetch_add(1, Ordering::Relaxed);
        shared.queues.finished.push(task);
        count += 1;
    }
    count
}

/// Run calls made into the controlling thread.
fn process_incoming(shared: &Arc<Shared>) -> usize {
    let mut count = 0;
    while let Some(request) = shared.queues.incoming.pop() {
        run_call(shared, request);
        count += 1;
    }
    count
}

fn run_call(shared: &Arc<Shared>, request: CallRequest) {
    let CallRequest {
        callable,
        args,
        reply,
    } = request;
    let kind = if reply.is_some() {
        WorkKind::SyncWait
    } else {
        WorkKind::SyncNoWait
    };
    let counters = shared.counters.kind(kind);
    counters.start();

    let mut ctx = WorkContext::new(Arc::clone(shared), None);
    let result = callable(&mut ctx, &args);
    counters.finish(result.is_err());

    match reply {
        Some(reply) => {
            if reply.send(result).is_err() {
                tracing::debug!(target: "pump", "caller stopped waiting for its result");
            }
        }
        None => match result {
            Ok(value) if !value.is_none() => {
                tracing::warn!(
                    target: "pump",
                    kind = value.type_name(),
                    "main-thread call returned a value that will be ignored"
                );
            }
            Ok(_) => {}
            Err(error) => shared.queues.push_error(None, error),
        },
    }
}
