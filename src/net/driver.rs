//! Worker-side connection jobs
//!
//! Each job owns one task reference. A connection that has to wait takes a
//! fresh reference for its reactor registration before the job's own is
//! dropped.

use super::connection::{Entry, Interest, Outcome};
use super::reactor::Target;
use super::server::{self, Listener};
use super::transport::TcpTransport;
use crate::context::{Task, TaskInner, TaskState};
use crate::errors::PxError;
use crate::metrics::WorkKind;
use crate::runtime::worker::Job;
use crate::runtime::Shared;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Queue a connection step on the worker pool; the job takes over one reference.
pub(crate) fn post(shared: &Shared, task: Arc<Task>, entry: Entry) {
    shared.counters.kind(WorkKind::Io).submit();
    task.set_state(TaskState::Queued);
    shared.send_job(Job::Io(task, entry));
}

/// Advance a connection and route it by where it stopped.
pub(crate) fn drive(shared: &Arc<Shared>, task: Arc<Task>, entry: Entry) {
    let counters = shared.counters.kind(WorkKind::Io);
    counters.start();
    shared.counters.active_ioloops.fetch_add(1, Ordering::AcqRel);
    task.set_state(TaskState::Running);

    let (outcome, fd, listener) = {
        let mut inner = task.lock();
        let TaskInner {
            arena,
            conn,
            listener,
            ..
        } = &mut *inner;
        match (arena.as_mut(), conn.as_mut()) {
            (Some(arena), Some(conn)) => {
                let outcome = conn.resume(arena, &shared.net, entry);
                (outcome, conn.raw_fd(), listener.clone())
            }
            _ => (
                Outcome::Fatal(PxError::violation(format!("{} has no connection", task.id()))),
                None,
                listener.clone(),
            ),
        }
    };
    shared.counters.ioloop_exit();

    match outcome {
        Outcome::Wait(interest) => {
            counters.finish(false);
            wait(shared, &task, fd, interest);
        }
        Outcome::Recycle => {
            counters.finish(false);
            match listener {
                Some(listener) => recycle(shared, &task, &listener),
                None => complete(shared, &task),
            }
        }
        Outcome::Closed => {
            counters.finish(false);
            complete(shared, &task);
        }
        Outcome::Fatal(error) => {
            counters.finish(true);
            tracing::debug!(target: "net", id = task.id().get(), %error, "connection failed");
            task.set_state(TaskState::Errored);
            shared.queues.push_error(Some(Arc::clone(&task)), error);
            if let Some(listener) = listener {
                if let Err(error) = server::spawn_pooled(shared, &listener) {
                    tracing::warn!(target: "net", %error, "could not replace pooled connection");
                }
            }
        }
    }

    shared.wake.signal();
    shared.decref(&task);
}

fn complete(shared: &Shared, task: &Arc<Task>) {
    task.set_state(TaskState::Completed);
    shared.queues.completed_callbacks.push(Arc::clone(task));
}

/// Arm the reactor for `interest`; the registration holds a reference.
fn wait(shared: &Arc<Shared>, task: &Arc<Task>, fd: Option<RawFd>, interest: Interest) {
    task.set_state(TaskState::Queued);
    let armed = fd
        .ok_or_else(|| PxError::violation(format!("{} waits without a socket", task.id())))
        .and_then(|fd| {
            let reactor = shared.reactor()?;
            task.incref();
            reactor
                .arm(task.id().get(), fd, interest, Target::Conn(Arc::clone(task)))
                .map_err(|e| {
                    shared.decref(task);
                    PxError::io("epoll_ctl", e)
                })
        });
    if let Err(error) = armed {
        task.set_state(TaskState::Errored);
        shared.queues.push_error(Some(Arc::clone(task)), error);
    }
}

/// Unwind the arena to a fresh root and hand the connection back to its listener.
fn recycle(shared: &Arc<Shared>, task: &Arc<Task>, listener: &Arc<Listener>) {
    {
        let mut inner = task.lock();
        let TaskInner {
            arena, root, conn, ..
        } = &mut *inner;
        if let Some(arena) = arena.as_mut() {
            let unwound = arena.reset_to_root();
            match arena.snapshot() {
                Ok(snapshot) => {
                    task.set_root_scope(snapshot.id());
                    *root = Some(snapshot);
                }
                Err(error) => {
                    tracing::warn!(target: "net", id = task.id().get(), %error, "could not take root snapshot");
                    *root = None;
                }
            }
            tracing::trace!(target: "net", id = task.id().get(), unwound, "arena reset");
        }
        if let Some(conn) = conn.as_mut() {
            conn.reset();
        }
    }
    shared.counters.tasks_recycled.fetch_add(1, Ordering::Relaxed);
    server::repost(shared, Arc::clone(task), listener);
}

/// Accept into waiting pooled connections until the backlog or the pool runs dry.
pub(crate) fn accept(shared: &Arc<Shared>, listener: &Arc<Listener>) {
    while let Some(task) = listener.waiting.pop() {
        match listener.socket.accept() {
            Ok((stream, peer)) => {
                let transport = match TcpTransport::new(stream) {
                    Ok(transport) => transport,
                    Err(err) => {
                        tracing::warn!(target: "net", %peer, %err, "could not configure accepted socket");
                        listener.waiting.push(task);
                        continue;
                    }
                };
                if let Some(conn) = task.lock().conn.as_mut() {
                    conn.attach(Box::new(transport));
                }
                tracing::trace!(target: "net", id = task.id().get(), %peer, "accepted");
                post(shared, task, Entry::Established);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => listener.waiting.push(task),
            Err(err) => {
                if err.kind() != io::ErrorKind::WouldBlock {
                    tracing::warn!(target: "net", %err, "accept failed");
                }
                listener.waiting.push(task);
                server::arm_listener(shared, listener);
                return;
            }
        }
    }
}

/// Connect a client task, then run its first step.
pub(crate) fn connect(shared: &Arc<Shared>, task: Arc<Task>, addr: SocketAddr) {
    let entry = match TcpStream::connect(addr).and_then(TcpTransport::new) {
        Ok(transport) => {
            if let Some(conn) = task.lock().conn.as_mut() {
                conn.attach(Box::new(transport));
            }
            Entry::Established
        }
        Err(err) => Entry::Failed(PxError::io("connect", err)),
    };
    drive(shared, task, entry);
}
