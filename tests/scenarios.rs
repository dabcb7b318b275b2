use pxengine::{
    Args, Event, FixedMemoryProbe, PxError, Runtime, RuntimeConfig, TaskState, Value, Work,
    WorkKind,
};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn runtime(workers: usize) -> Runtime {
    Runtime::builder()
        .config(RuntimeConfig::default().with_wake_timeout_ms(20))
        .workers(workers)
        .memory_probe(Arc::new(FixedMemoryProbe::new(10)))
        .build()
        .expect("runtime")
}

/// Pump until no task is alive, collecting raised errors in order.
fn drain(rt: &Runtime) -> Vec<PxError> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut errors = Vec::new();
    while rt.stats().tasks_active > 0 {
        assert!(Instant::now() < deadline, "tasks still active after 10s");
        match rt.run_once() {
            Ok(()) | Err(PxError::RunWithoutEvents) => {}
            Err(err) => errors.push(err),
        }
    }
    errors
}

#[test]
fn submit_run_destroy() {
    let rt = runtime(4);
    let hits = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();

    for i in 0..32i64 {
        let seen = Arc::clone(&hits);
        let id = rt
            .submit(
                Work::new(move |ctx, args| {
                    let n = args.get(0).and_then(Value::as_int).unwrap_or_default();
                    let block = ctx.alloc_bytes(&n.to_le_bytes())?;
                    assert_eq!(ctx.read(&block)?, n.to_le_bytes());
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Int(n))
                })
                .with_args(Args::new().arg(i)),
            )
            .expect("submit");
        tasks.push(rt.task(id).expect("registered"));
    }

    rt.run().expect("run");

    assert_eq!(hits.load(Ordering::SeqCst), 32);
    for task in &tasks {
        assert!(task.is_destroyed());
        assert_eq!(task.state(), TaskState::Destroyed);
        assert_eq!(task.increments(), task.decrements());
        assert_eq!(task.refs(), 0);
    }
    let stats = rt.stats();
    assert_eq!(stats.tasks_created, 32);
    assert_eq!(stats.tasks_destroyed, 32);
    assert_eq!(stats.callbacks_completed, 32);
    assert_eq!(rt.run_once(), Err(PxError::RunWithoutEvents));
}

#[test]
fn errors_raised_in_completion_order() {
    let rt = runtime(1);
    for i in 0..3 {
        rt.submit(Work::new(move |_, _| Err(PxError::Callback(format!("e{i}")))))
            .expect("submit");
    }

    let raised = drain(&rt);
    assert_eq!(
        raised,
        vec![
            PxError::Callback("e0".into()),
            PxError::Callback("e1".into()),
            PxError::Callback("e2".into()),
        ]
    );
}

#[test]
fn submit_and_wait_from_another_thread() {
    let rt = runtime(2);
    let worker_rt = rt.clone();
    let caller = thread::spawn(move || {
        worker_rt.submit_and_wait(
            |_, args| {
                let a = args.get(0).and_then(Value::as_int).unwrap_or_default();
                let b = args.get(1).and_then(Value::as_int).unwrap_or_default();
                Ok(Value::Int(a * b))
            },
            Args::new().arg(6i64).arg(7i64),
        )
    });

    let answered = rt
        .run_until(Duration::from_secs(10), |_| caller.is_finished())
        .expect("pump");
    assert!(answered);
    let value = caller.join().expect("join").expect("call");
    assert_eq!(value, Value::Int(42));
}

#[test]
fn wait_then_timer() {
    let rt = runtime(2);
    let order = Arc::new(Mutex::new(Vec::new()));
    let event = Event::new();

    let log = Arc::clone(&order);
    rt.submit_wait(
        &event,
        Some(Duration::from_secs(5)),
        Work::new(move |_, _| {
            log.lock().push("wait");
            Ok(Value::None)
        }),
    )
    .expect("wait");

    let log = Arc::clone(&order);
    let trigger = event.clone();
    rt.submit_timer(
        Duration::from_millis(30),
        Work::new(move |_, _| {
            log.lock().push("timer");
            trigger.set();
            Ok(Value::None)
        }),
    )
    .expect("timer");

    assert!(drain(&rt).is_empty());
    assert_eq!(*order.lock(), vec!["timer", "wait"]);
    assert_eq!(event.waiting(), 0);
}

#[test]
fn wait_timeout_reaches_errback() {
    let rt = runtime(1);
    let event = Event::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let out = Arc::clone(&seen);

    rt.submit_wait(
        &event,
        Some(Duration::from_millis(20)),
        Work::new(|_, _| Ok(Value::Str("ran".into()))).on_error(move |_, err| {
            out.lock().push(err.clone());
            Ok(())
        }),
    )
    .expect("wait");

    assert!(drain(&rt).is_empty());
    event.set();
    assert_eq!(*seen.lock(), vec![PxError::WaitTimeout]);
    assert_eq!(rt.stats().errbacks_completed, 1);
}

#[test]
fn persisted_block_survives_until_dropped() {
    let rt = runtime(2);
    let slot = Arc::new(Mutex::new(None));
    let out = Arc::clone(&slot);
    rt.submit(Work::new(move |ctx, _| {
        let block = ctx.alloc_bytes(b"long lived")?;
        *out.lock() = Some(ctx.persist(&block)?);
        Ok(Value::None)
    }))
    .expect("submit");

    let parked = rt
        .run_until(Duration::from_secs(5), |rt| rt.stats().tasks_persisted == 1)
        .expect("pump");
    assert!(parked);

    let handle = slot.lock().take().expect("persisted");
    assert_eq!(handle.read().expect("read"), b"long lived");
    let copy = handle.clone();
    drop(handle);
    assert_eq!(copy.read().expect("read"), b"long lived");
    drop(copy);

    let destroyed = rt
        .run_until(Duration::from_secs(5), |rt| rt.stats().tasks_destroyed == 1)
        .expect("pump");
    assert!(destroyed);
}

#[test]
fn refused_at_hard_memory_limit() {
    let sampler = Arc::new(FixedMemoryProbe::new(10));
    let rt = Runtime::builder()
        .config(RuntimeConfig::default().with_memory_limits(70, 90))
        .workers(1)
        .memory_probe(sampler.clone())
        .build()
        .expect("runtime");

    sampler.set(95);
    rt.refresh_memory_load();
    let refused = rt.submit(Work::new(|_, _| Ok(Value::None)));
    assert!(matches!(refused, Err(PxError::AllocationFailure(_))));
    assert_eq!(rt.stats().tasks_created, 0);

    sampler.set(10);
    rt.refresh_memory_load();
    rt.submit(Work::new(|_, _| Ok(Value::None))).expect("admitted");
    rt.run().expect("run");
}

#[test]
fn file_write_runs_on_the_pool() {
    let target = tempfile::NamedTempFile::new().expect("tempfile");
    let file = OpenOptions::new().write(true).open(target.path()).expect("open");
    let rt = runtime(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let out = Arc::clone(&seen);

    let mut payload = b"written off the main thread".to_vec();
    rt.submit_write_io(
        &file,
        &payload,
        Work::new(|_, args| Ok(args.get(0).cloned().unwrap_or_default())).on_success(move |_, value| {
            out.lock().push(value);
            Ok(())
        }),
    )
    .expect("submit");
    // The bytes were copied at submission.
    payload.fill(b'x');

    assert!(drain(&rt).is_empty());
    assert_eq!(*seen.lock(), vec![Value::Int(27)]);
    assert_eq!(fs::read(target.path()).expect("read back"), b"written off the main thread");

    let io = rt.stats().kind(WorkKind::Io);
    assert_eq!(io.submitted, 1);
    assert_eq!(io.done, 1);
    assert_eq!(io.errors, 0);
    assert_eq!(rt.stats().callbacks_completed, 1);
}

#[test]
fn failed_file_write_reaches_errback() {
    let target = tempfile::NamedTempFile::new().expect("tempfile");
    // Writing through a read-only descriptor fails with EBADF.
    let read_only = File::open(target.path()).expect("open");
    let rt = runtime(1);
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::clone(&ran);
    let out = Arc::clone(&seen);

    rt.submit_write_io(
        &read_only,
        b"never lands",
        Work::new(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::None)
        })
        .on_error(move |_, err| {
            out.lock().push(err.clone());
            Ok(())
        }),
    )
    .expect("submit");

    assert!(drain(&rt).is_empty());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    let errors = seen.lock();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        PxError::FatalIo { op, message, .. } => {
            assert_eq!(*op, "write");
            assert!(message.contains("os error 9"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(fs::read(target.path()).expect("read back").is_empty());

    let stats = rt.stats();
    assert_eq!(stats.errbacks_completed, 1);
    assert_eq!(stats.kind(WorkKind::Io).errors, 1);
}

#[test]
fn unhandled_file_write_error_is_raised() {
    let target = tempfile::NamedTempFile::new().expect("tempfile");
    let read_only = File::open(target.path()).expect("open");
    let rt = runtime(1);

    rt.submit_write_io(&read_only, b"abc", Work::new(|_, _| Ok(Value::None)))
        .expect("submit");

    let raised = drain(&rt);
    assert_eq!(raised.len(), 1);
    assert!(matches!(raised[0], PxError::FatalIo { op: "write", .. }));
}
