//! Task records
//!
//! Design: the lifecycle counters are atomics so the pump, workers and the
//! reactor can read them without locking; everything a running step needs
//! exclusively (arena, pending work, connection) sits behind one mutex, which
//! also serializes state-machine steps for connection tasks.

use super::work::Work;
use crate::net::Connection;
use parking_lot::{Mutex, MutexGuard};
use pxengine_runtime::{Arena, Snapshot, ROOT_SCOPE};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(target_os = "linux")]
use crate::net::server::Listener;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// What a task was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Work,
    Wait,
    Timer,
    FileWrite,
    Connection,
    Listener,
}

/// Lifecycle position of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Queued = 1,
    Running = 2,
    Completed = 3,
    Errored = 4,
    Finished = 5,
    Persisted = 6,
    Destroyed = 7,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Completed,
            4 => Self::Errored,
            5 => Self::Finished,
            6 => Self::Persisted,
            _ => Self::Destroyed,
        }
    }
}

/// Exclusively-owned parts of a task.
#[derive(Default)]
pub(crate) struct TaskInner {
    pub arena: Option<Arena>,
    pub root: Option<Snapshot>,
    pub work: Option<Work>,
    pub conn: Option<Connection>,
    #[cfg(target_os = "linux")]
    pub listener: Option<Arc<Listener>>,
}

pub struct Task {
    id: TaskId,
    kind: TaskKind,
    state: AtomicU8,
    refs: AtomicUsize,
    ttl: AtomicU8,
    persisted: AtomicUsize,
    increments: AtomicU64,
    decrements: AtomicU64,
    root_scope: AtomicU64,
    armed: AtomicBool,
    destroyed: AtomicBool,
    was_persisted: AtomicBool,
    lifecycle: Mutex<()>,
    inner: Mutex<TaskInner>,
}

impl Task {
    /// A task holding its registration reference, with a root snapshot
    /// taken on its arena.
    pub(crate) fn new(kind: TaskKind, ttl: u8, arena: Option<Arena>) -> crate::Result<Arc<Self>> {
        let mut inner = TaskInner {
            arena,
            ..TaskInner::default()
        };
        let root_scope = match inner.arena.as_mut() {
            Some(arena) => {
                let root = arena.snapshot()?;
                let id = root.id();
                inner.root = Some(root);
                id
            }
            None => ROOT_SCOPE,
        };

        let task = Arc::new(Self {
            id: TaskId::next(),
            kind,
            state: AtomicU8::new(TaskState::Created as u8),
            refs: AtomicUsize::new(1),
            ttl: AtomicU8::new(ttl),
            persisted: AtomicUsize::new(0),
            increments: AtomicU64::new(1),
            decrements: AtomicU64::new(0),
            root_scope: AtomicU64::new(root_scope),
            armed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            was_persisted: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            inner: Mutex::new(inner),
        });
        tracing::trace!(target: "task", id = task.id.get(), ?kind, "task created");
        Ok(task)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Outstanding references.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Pump cycles left before a released task is destroyed.
    pub fn ttl(&self) -> u8 {
        self.ttl.load(Ordering::Acquire)
    }

    /// Live persisted-value handles into this task's arena.
    pub fn persisted_count(&self) -> usize {
        self.persisted.load(Ordering::Acquire)
    }

    /// Total references ever taken, including the initial one.
    pub fn increments(&self) -> u64 {
        self.increments.load(Ordering::Acquire)
    }

    pub fn decrements(&self) -> u64 {
        self.decrements.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn was_persisted(&self) -> bool {
        self.was_persisted.load(Ordering::Acquire)
    }

    /// Snapshot id of the task's root scope.
    pub fn root_scope(&self) -> u64 {
        self.root_scope.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_root_scope(&self, scope: u64) {
        self.root_scope.store(scope, Ordering::Release);
    }

    pub(crate) fn incref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
        self.increments.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; returns the count left.
    pub(crate) fn decref(&self) -> usize {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => {
                self.decrements.fetch_add(1, Ordering::AcqRel);
                prev - 1
            }
            Err(_) => {
                tracing::error!(target: "task", id = self.id.get(), "reference released twice");
                0
            }
        }
    }

    /// Count one pump cycle down; false once the ttl is exhausted.
    pub(crate) fn tick_ttl(&self) -> bool {
        self.ttl
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
            .is_ok()
    }

    /// Mark the task as waiting on a single wake-up source.
    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Take the pending wake-up; only the first caller wins.
    pub(crate) fn claim(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Set the destroyed flag; true only for the first caller.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock()
    }

    pub(crate) fn add_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one persisted handle; returns the handles left.
    pub(crate) fn remove_persisted(&self) -> usize {
        self.persisted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .unwrap_or(0)
    }

    pub(crate) fn mark_persisted(&self) {
        self.was_persisted.store(true, Ordering::Release);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, TaskInner>> {
        self.inner.try_lock()
    }

    /// Drop the arena, pending work and connection.
    pub(crate) fn teardown(&self) {
        let inner = std::mem::take(&mut *self.inner.lock());
        drop(inner);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("refs", &self.refs())
            .field("ttl", &self.ttl())
            .field("persisted", &self.persisted_count())
            .finish()
    }
}
