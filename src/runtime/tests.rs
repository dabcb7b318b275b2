//! Pump, lifecycle and worker-pool tests
//!
//! - Pump: idle detection, error ordering, purge timing
//! - Completion paths: callbacks, errbacks, panics
//! - Controlling-thread calls
//! - Waits and timers
//! - Backpressure and shutdown

use super::*;
use crate::context::Work;
use std::sync::atomic::AtomicUsize;

fn config() -> RuntimeConfig {
    RuntimeConfig::default().with_wake_timeout_ms(20)
}

fn runtime(workers: usize) -> Runtime {
    Runtime::builder()
        .config(config())
        .workers(workers)
        .memory_probe(Arc::new(FixedMemoryProbe::new(10)))
        .build()
        .expect("runtime")
}

/// Pump until no task is alive, collecting raised errors.
fn drain(rt: &Runtime) -> Vec<PxError> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut errors = Vec::new();
    while rt.shared.counters.active() > 0 && Instant::now() < deadline {
        match rt.run_once() {
            Ok(()) | Err(PxError::RunWithoutEvents) => {}
            Err(err) => errors.push(err),
        }
    }
    errors
}

// ===== Pump =====

#[test]
fn run_once_without_events_is_an_error() {
    let rt = runtime(1);
    assert_eq!(rt.run_once(), Err(PxError::RunWithoutEvents));
}

#[test]
fn submitted_work_runs_and_is_destroyed() {
    let rt = runtime(2);
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let id = rt
        .submit(Work::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::None)
        }))
        .expect("submit");
    let task = rt.task(id).expect("registered");

    rt.run().expect("run");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(task.is_destroyed());
    assert_eq!(task.state(), TaskState::Destroyed);
    assert_eq!(task.increments(), task.decrements());
    assert!(rt.task(id).is_none());

    let stats = rt.stats();
    assert_eq!(stats.tasks_created, 1);
    assert_eq!(stats.tasks_destroyed, 1);
    assert_eq!(stats.tasks_active, 0);
    assert_eq!(stats.callbacks_completed, 1);
    assert_eq!(stats.kind(WorkKind::Work).done, 1);
    assert!(rt.timing("task").is_some());
}

#[test]
fn purge_waits_out_the_ttl() {
    let rt = Runtime::builder()
        .config(config().with_task_ttl(3))
        .workers(1)
        .memory_probe(Arc::new(FixedMemoryProbe::new(10)))
        .build()
        .expect("runtime");
    let shared = rt.shared();
    let task = shared.create_task(TaskKind::Work, None).expect("task");
    shared.decref(&task);

    // One cycle to enter the purge list, one per ttl tick, one to destroy.
    for _ in 0..4 {
        rt.run_once().expect("cycle");
        assert!(!task.is_destroyed());
    }
    rt.run_once().expect("cycle");
    assert!(task.is_destroyed());
    assert_eq!(shared.counters.active(), 0);
}

#[test]
fn errors_are_raised_one_per_cycle_in_order() {
    let rt = runtime(1);
    for i in 0..3 {
        rt.submit(Work::new(move |_, _| Err(PxError::callback(format!("e{}", i)))))
            .expect("submit");
    }

    let errors = drain(&rt);
    assert_eq!(
        errors,
        vec![
            PxError::callback("e0"),
            PxError::callback("e1"),
            PxError::callback("e2"),
        ]
    );
    assert_eq!(rt.stats().errors_raised, 3);
    assert_eq!(rt.stats().tasks_destroyed, 3);
}

// ===== Completion Paths =====

#[test]
fn success_callback_receives_the_value() {
    let rt = runtime(2);
    let got = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&got);
    rt.submit(
        Work::new(|_, args| Ok(Value::Int(args.get(0).and_then(Value::as_int).unwrap_or(0) * 2)))
            .with_args(vec![Value::Int(21)])
            .on_success(move |_, value| {
                *slot.lock() = Some(value);
                Ok(())
            }),
    )
    .expect("submit");

    assert!(drain(&rt).is_empty());
    assert_eq!(*got.lock(), Some(Value::Int(42)));
}

#[test]
fn errback_handles_failure() {
    let rt = runtime(1);
    let handled = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&handled);
    rt.submit(
        Work::new(|_, _| Err(PxError::callback("bad input"))).on_error(move |_, err| {
            *slot.lock() = Some(err.clone());
            Ok(())
        }),
    )
    .expect("submit");

    assert!(drain(&rt).is_empty());
    assert_eq!(*handled.lock(), Some(PxError::callback("bad input")));
    assert_eq!(rt.stats().errbacks_completed, 1);
}

#[test]
fn failing_callback_routes_to_errback() {
    let rt = runtime(1);
    let handled = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&handled);
    rt.submit(
        Work::new(|_, _| Ok(Value::None))
            .on_success(|_, _| Err(PxError::callback("callback failed")))
            .on_error(move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
    )
    .expect("submit");

    assert!(drain(&rt).is_empty());
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_work_becomes_a_callback_error() {
    let rt = runtime(1);
    rt.submit(Work::new(|_, _| panic!("kaboom"))).expect("submit");
    assert_eq!(drain(&rt), vec![PxError::callback("kaboom")]);
}

#[test]
fn nested_submissions_are_dispatched_by_the_pump() {
    let rt = runtime(2);
    let hits = Arc::new(AtomicUsize::new(0));
    let outer = Arc::clone(&hits);
    rt.submit(Work::new(move |ctx, _| {
        let inner = Arc::clone(&outer);
        ctx.submit(Work::new(move |_, _| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(Value::None)
        }))?;
        outer.fetch_add(1, Ordering::SeqCst);
        Ok(Value::None)
    }))
    .expect("submit");

    assert!(drain(&rt).is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(rt.stats().tasks_destroyed, 2);
}

// ===== Controlling-Thread Calls =====

#[test]
fn call_from_main_thread_runs_on_the_pump() {
    let rt = runtime(1);
    let ran_on = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&ran_on);
    rt.submit(Work::new(move |ctx, _| {
        let slot = Arc::clone(&slot);
        ctx.call_from_main_thread(
            move |_, _| {
                *slot.lock() = Some(thread::current().id());
                Ok(Value::None)
            },
            Args::new(),
        )?;
        Ok(Value::None)
    }))
    .expect("submit");

    let done = rt
        .run_until(Duration::from_secs(5), |_| ran_on.lock().is_some())
        .expect("run");
    assert!(done);
    assert_eq!(*ran_on.lock(), Some(thread::current().id()));
    drain(&rt);
}

#[test]
fn submit_and_wait_from_another_thread() {
    let rt = runtime(1);
    let remote = rt.clone();
    let caller = thread::spawn(move || {
        remote.submit_and_wait(
            |_, args| Ok(Value::Int(args.get(0).and_then(Value::as_int).unwrap_or(0) + 1)),
            vec![Value::Int(41)],
        )
    });

    let done = rt
        .run_until(Duration::from_secs(5), |_| caller.is_finished())
        .expect("run");
    assert!(done);
    let result = caller.join().expect("caller thread");
    assert_eq!(result, Ok(Value::Int(42)));
    assert_eq!(rt.stats().kind(WorkKind::SyncWait).done, 1);
}

#[test]
fn submit_and_wait_on_the_controlling_thread_is_refused() {
    let rt = runtime(1);
    let result = rt.submit_and_wait(|_, _| Ok(Value::None), Args::new());
    assert!(matches!(result, Err(PxError::ProtocolViolation(_))));
}

// ===== Waits and Timers =====

#[test]
fn wait_runs_once_event_is_set() {
    let rt = runtime(2);
    let event = Event::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    rt.submit_wait(
        &event,
        None,
        Work::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::None)
        }),
    )
    .expect("submit_wait");

    let ran = rt
        .run_until(Duration::from_millis(100), |_| hits.load(Ordering::SeqCst) > 0)
        .expect("run");
    assert!(!ran);
    assert_eq!(event.waiting(), 1);

    event.set();
    assert!(drain(&rt).is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(event.waiting(), 0);
}

#[test]
fn wait_on_a_set_event_runs_immediately() {
    let rt = runtime(1);
    let event = Event::new();
    event.set();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    rt.submit_wait(
        &event,
        None,
        Work::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::None)
        }),
    )
    .expect("submit_wait");

    assert!(drain(&rt).is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn wait_timeout_runs_the_error_path_once() {
    let rt = runtime(2);
    let event = Event::new();
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let ok = Arc::clone(&outcomes);
    let failed = Arc::clone(&outcomes);
    rt.submit_wait(
        &event,
        Some(Duration::from_millis(30)),
        Work::new(move |_, _| {
            ok.lock().push(None);
            Ok(Value::None)
        })
        .on_error(move |_, err| {
            failed.lock().push(Some(err.clone()));
            Ok(())
        }),
    )
    .expect("submit_wait");

    assert!(drain(&rt).is_empty());
    event.set();
    assert_eq!(*outcomes.lock(), vec![Some(PxError::WaitTimeout)]);
    assert_eq!(rt.stats().kind(WorkKind::Wait).errors, 1);
}

#[test]
fn signalled_wait_drops_its_deadline() {
    let rt = runtime(1);
    let event = Event::new();
    let id = rt
        .submit_wait(&event, Some(Duration::from_secs(3600)), Work::new(|_, _| Ok(Value::None)))
        .expect("submit_wait");
    let task = rt.task(id).expect("registered");
    assert_eq!(rt.shared.scheduler.len(), 1);

    event.set();
    assert!(drain(&rt).is_empty());
    assert!(task.is_destroyed());
    assert_eq!(rt.shared.scheduler.len(), 0);
}

#[test]
fn timed_out_waiter_leaves_the_event() {
    let rt = runtime(1);
    let event = Event::new();
    rt.submit_wait(
        &event,
        Some(Duration::from_millis(20)),
        Work::new(|_, _| Ok(Value::None)).on_error(|_, _| Ok(())),
    )
    .expect("submit_wait");
    assert_eq!(event.waiting(), 1);

    assert!(drain(&rt).is_empty());
    assert_eq!(event.waiting(), 0);
    assert!(!event.is_set());
}

#[test]
fn timer_fires_after_its_delay() {
    let rt = runtime(1);
    let started = Instant::now();
    let fired = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&fired);
    rt.submit_timer(
        Duration::from_millis(40),
        Work::new(move |_, _| {
            *slot.lock() = Some(started.elapsed());
            Ok(Value::None)
        }),
    )
    .expect("submit_timer");

    assert!(drain(&rt).is_empty());
    let elapsed = fired.lock().expect("timer ran");
    assert!(elapsed >= Duration::from_millis(40));
}

// ===== Backpressure and Shutdown =====

#[test]
fn hard_memory_limit_refuses_new_tasks() {
    let probe = Arc::new(FixedMemoryProbe::new(10));
    let rt = Runtime::builder()
        .config(config())
        .workers(1)
        .memory_probe(probe.clone())
        .build()
        .expect("runtime");

    probe.set(95);
    assert_eq!(rt.refresh_memory_load(), 95);
    let result = rt.submit(Work::new(|_, _| Ok(Value::None)));
    assert!(matches!(result, Err(PxError::AllocationFailure(_))));
    assert_eq!(rt.stats().tasks_created, 0);

    probe.set(50);
    rt.refresh_memory_load();
    assert!(rt.submit(Work::new(|_, _| Ok(Value::None))).is_ok());
    assert!(drain(&rt).is_empty());
}

#[test]
fn shutdown_refuses_further_work() {
    let rt = runtime(2);
    rt.shutdown();
    assert_eq!(rt.run_once(), Err(PxError::Shutdown));
    assert!(matches!(rt.submit(Work::new(|_, _| Ok(Value::None))), Err(PxError::Shutdown)));
}

#[test]
fn stats_serialize_to_json() {
    let rt = runtime(3);
    let json = rt.stats().to_json();
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("json");
    assert_eq!(parsed["workers"], 3);
    assert!(parsed["kinds"]["work"].is_object());
}
