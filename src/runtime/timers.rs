//! Events, waits and timers
//!
//! Design: one scheduler thread owns a deadline heap. A waiting task is armed
//! once; whichever of its event or its deadline claims it first dispatches
//! it, and the loser finds it already claimed.

use super::worker::Job;
use crate::context::Task;
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

struct Waiter {
    task: Arc<Task>,
    jobs: Sender<Job>,
    /// Holds this task's timeout deadline, if it has one.
    timeout: Option<Scheduler>,
}

impl Waiter {
    fn fire(self) {
        if self.task.claim() {
            if let Some(scheduler) = &self.timeout {
                scheduler.discard_claimed();
            }
            let _ = self.jobs.send(Job::Run(self.task));
        }
    }
}

#[derive(Default)]
struct EventState {
    set: bool,
    waiters: Vec<Waiter>,
}

/// A manual-reset event tasks can wait on.
#[derive(Clone, Default)]
pub struct Event {
    state: Arc<Mutex<EventState>>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, releasing every waiting task. Stays set until cleared.
    pub fn set(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.set = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.fire();
        }
    }

    pub fn clear(&self) {
        self.state.lock().set = false;
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Tasks still waiting on this event.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Queue `task` until the event is set; fires it at once if already set.
    ///
    /// `timeout` is the scheduler holding the task's deadline, if any.
    pub(crate) fn add_waiter(&self, task: Arc<Task>, jobs: Sender<Job>, timeout: Option<Scheduler>) {
        let waiter = Waiter { task, jobs, timeout };
        let mut state = self.state.lock();
        if state.set {
            drop(state);
            waiter.fire();
            return;
        }
        state.waiters.retain(|w| w.task.is_armed());
        // The deadline may have claimed it already.
        if waiter.task.is_armed() {
            state.waiters.push(waiter);
        }
    }

    /// Drop waiters whose deadline claimed them first.
    fn discard_claimed(&self) {
        self.state.lock().waiters.retain(|w| w.task.is_armed());
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}

/// What happens when a deadline passes.
#[derive(Debug, Clone)]
pub(crate) enum Expiry {
    /// Timer: run the task.
    Run,
    /// Wait timeout: run the task's error path and drop it from the event.
    Expire(Event),
}

struct Deadline {
    at: Instant,
    seq: u64,
    task: Arc<Task>,
    expiry: Expiry,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

#[derive(Default)]
struct SchedulerInner {
    heap: Mutex<BinaryHeap<Reverse<Deadline>>>,
    cv: Condvar,
    stop: AtomicBool,
    seq: AtomicU64,
}

/// Deadline heap served by a dedicated thread.
#[derive(Clone, Default)]
pub(crate) struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, jobs: Sender<Job>) -> std::io::Result<JoinHandle<()>> {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("pxengine-timers".into())
            .spawn(move || run(&inner, &jobs))
    }

    /// Fire `expiry` for `task` at `at` unless something claims it first.
    pub fn schedule(&self, at: Instant, task: Arc<Task>, expiry: Expiry) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.heap.lock().push(Reverse(Deadline { at, seq, task, expiry }));
        self.inner.cv.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.heap.lock().len()
    }

    /// Remove deadlines whose task was claimed by something else.
    pub fn discard_claimed(&self) {
        self.inner.heap.lock().retain(|Reverse(d)| d.task.is_armed());
    }

    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        let _heap = self.inner.heap.lock();
        self.inner.cv.notify_all();
    }

    /// Drop every pending deadline.
    pub fn clear(&self) {
        self.inner.heap.lock().clear();
    }
}

fn run(inner: &SchedulerInner, jobs: &Sender<Job>) {
    let mut heap = inner.heap.lock();
    loop {
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        let now = Instant::now();
        let next = heap.peek().map(|Reverse(d)| d.at);
        match next {
            None => {
                inner.cv.wait(&mut heap);
            }
            Some(at) if at > now => {
                let _ = inner.cv.wait_until(&mut heap, at);
            }
            Some(_) => {
                if let Some(Reverse(deadline)) = heap.pop() {
                    if deadline.task.claim() {
                        tracing::trace!(
                            target: "task",
                            id = deadline.task.id().get(),
                            expiry = ?deadline.expiry,
                            "deadline reached"
                        );
                        let job = match deadline.expiry {
                            Expiry::Run => Job::Run(deadline.task),
                            Expiry::Expire(event) => {
                                event.discard_claimed();
                                Job::Expire(deadline.task)
                            }
                        };
                        let _ = jobs.send(job);
                    }
                }
            }
        }
    }
}
