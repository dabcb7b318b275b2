//! Listening sockets, client connects and connection housekeeping

use super::connection::{Connection, Entry, Interest};
use super::driver;
use super::protocol::{BoundProtocol, Protocol};
use super::reactor::Target;
use crate::context::{Task, TaskId, TaskKind, TaskState};
use crate::errors::{PxError, Result};
use crate::metrics::WorkKind;
use crate::runtime::worker::Job;
use crate::runtime::{Runtime, Shared};
use crossbeam::queue::SegQueue;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// A bound listener and the pooled connections waiting on it.
pub(crate) struct Listener {
    pub socket: TcpListener,
    pub protocol: Arc<BoundProtocol>,
    /// Pooled connection tasks ready to take the next accept.
    pub waiting: SegQueue<Arc<Task>>,
    pub task: Arc<Task>,
}

impl Listener {
    pub fn token(&self) -> u64 {
        self.task.id().get()
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// A running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHandle {
    id: TaskId,
    addr: SocketAddr,
}

impl ServerHandle {
    /// The listener's task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Runtime {
    /// Listen on `addr`, serving each accepted connection with `protocol`.
    ///
    /// Posts `net.accepts_to_post` pooled connections (twice the CPU count
    /// when unset). Pooled connections are recycled after they close.
    pub fn serve(&self, addr: impl ToSocketAddrs, protocol: Arc<dyn Protocol>) -> Result<ServerHandle> {
        let shared = self.shared();
        shared.admit()?;
        let protocol = Arc::new(BoundProtocol::bind(protocol, &shared.config.net)?);

        let socket = TcpListener::bind(addr).map_err(|e| PxError::io("bind", e))?;
        let backlog = shared.config.net.listen_backlog as libc::c_int;
        if unsafe { libc::listen(socket.as_raw_fd(), backlog) } < 0 {
            return Err(PxError::io("listen", std::io::Error::last_os_error()));
        }
        socket.set_nonblocking(true).map_err(|e| PxError::io("listen", e))?;
        let local = socket.local_addr().map_err(|e| PxError::io("listen", e))?;

        let task = shared.create_task(TaskKind::Listener, None)?;
        task.set_state(TaskState::Running);
        let id = task.id();
        let listener = Arc::new(Listener {
            socket,
            protocol,
            waiting: SegQueue::new(),
            task,
        });
        shared.listeners.lock().push(Arc::clone(&listener));
        shared.reactor()?;

        let pool = shared.config.accepts_to_post();
        for _ in 0..pool {
            spawn_pooled(shared, &listener)?;
        }
        tracing::info!(target: "net", addr = %local, pool, "serving");
        Ok(ServerHandle { id, addr: local })
    }

    /// Open a client connection to `addr` driven by `protocol`.
    pub fn connect(&self, addr: SocketAddr, protocol: Arc<dyn Protocol>) -> Result<TaskId> {
        let shared = self.shared();
        let protocol = Arc::new(BoundProtocol::bind(protocol, &shared.config.net)?);
        shared.admit()?;
        let arena = shared.new_arena()?;
        let task = shared.create_task(TaskKind::Connection, Some(arena))?;
        task.lock().conn = Some(Connection::client(protocol));
        shared.reactor()?;

        let id = task.id();
        shared.counters.kind(WorkKind::Io).submit();
        task.set_state(TaskState::Queued);
        task.incref();
        shared.send_job(Job::Connect(task, addr));
        Ok(id)
    }
}

/// Create one pooled connection task and post it to `listener`.
pub(crate) fn spawn_pooled(shared: &Arc<Shared>, listener: &Arc<Listener>) -> Result<()> {
    let arena = shared.new_arena()?;
    let task = shared.create_task(TaskKind::Connection, Some(arena))?;
    {
        let mut inner = task.lock();
        inner.conn = Some(Connection::pooled(Arc::clone(&listener.protocol)));
        inner.listener = Some(Arc::clone(listener));
    }
    repost(shared, task, listener);
    Ok(())
}

/// Make a pooled connection available for the next accept. The queue entry
/// holds one reference. Above the hard memory limit the post is deferred.
pub(crate) fn repost(shared: &Arc<Shared>, task: Arc<Task>, listener: &Arc<Listener>) {
    task.incref();
    task.set_state(TaskState::Queued);
    if shared.memory.above_hard() {
        tracing::debug!(target: "net", id = task.id().get(), "accept deferred: memory load above hard limit");
        shared.queues.deferred_accepts.push(task);
        return;
    }
    listener.waiting.push(task);
    shared.counters.accepts_posted.fetch_add(1, Ordering::Relaxed);
    arm_listener(shared, listener);
}

pub(crate) fn arm_listener(shared: &Arc<Shared>, listener: &Arc<Listener>) {
    let result = shared.reactor().and_then(|reactor| {
        reactor
            .arm(listener.token(), listener.fd(), Interest::Read, Target::Listener(Arc::clone(listener)))
            .map_err(|e| PxError::io("epoll_ctl", e))
    });
    if let Err(error) = result {
        tracing::error!(target: "net", %error, "could not arm listener");
    }
}

/// Per-cycle connection upkeep run by the pump; returns work done.
pub(crate) fn housekeeping(shared: &Arc<Shared>) -> usize {
    let mut progress = 0;

    if !shared.queues.deferred_accepts.is_empty() && !shared.memory.above_hard() {
        while let Some(task) = shared.queues.deferred_accepts.pop() {
            let listener = task.lock().listener.clone();
            match listener {
                Some(listener) => {
                    listener.waiting.push(task);
                    shared.counters.accepts_posted.fetch_add(1, Ordering::Relaxed);
                    arm_listener(shared, &listener);
                }
                None => shared.decref(&task),
            }
            progress += 1;
        }
    }

    if shared.memory.above_soft() {
        progress += reap_idle(shared);
    }
    progress
}

/// Close pooled connections idle in `Receiving` for longer than the reap delay.
fn reap_idle(shared: &Arc<Shared>) -> usize {
    let Some(reactor) = shared.reactor.get() else {
        return 0;
    };
    let after = Duration::from_millis(shared.config.net.idle_reap_after_ms);

    let idle: Vec<(Arc<Task>, RawFd)> = shared
        .registry
        .iter()
        .filter(|entry| entry.value().kind() == TaskKind::Connection)
        .filter_map(|entry| {
            let task = entry.value();
            let inner = task.try_lock()?;
            let conn = inner.conn.as_ref()?;
            let idle = conn.is_pooled()
                && conn.state() == super::ConnState::Receiving
                && conn.idle_for() >= after;
            let fd = conn.raw_fd()?;
            idle.then(|| (Arc::clone(task), fd))
        })
        .collect();

    let mut reaped = 0;
    for (task, fd) in idle {
        if let Some(Target::Conn(task)) = reactor.disarm(task.id().get(), fd) {
            driver::post(shared, task, Entry::Reap);
            shared.counters.connections_reaped.fetch_add(1, Ordering::Relaxed);
            reaped += 1;
        }
    }
    if reaped > 0 {
        tracing::info!(target: "net", reaped, load = shared.memory.load(), "reaped idle connections");
    }
    reaped
}
