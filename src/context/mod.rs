//! Tasks: units of work that own an arena
//!
//! A task is created with one registration reference. Every queue entry,
//! dispatched job or armed wake-up holds one more; the pump drops the
//! registration reference once the task has finished. At zero references a
//! task is either parked as `Persisted` (values allocated in its arena are
//! still referenced) or handed to the purge list, where its ttl counts down
//! one pump cycle at a time before it is destroyed exactly once.

mod persist;
mod task;
mod work;


pub use persist::Persisted;
pub use task::{Task, TaskId, TaskKind, TaskState};
pub use work::{Callable, OnError, OnSuccess, Work, WorkContext};

pub(crate) use task::TaskInner;
