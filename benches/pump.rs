use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pxengine::{Args, Event, FixedMemoryProbe, Runtime, RuntimeConfig, Value, Work};
use std::sync::Arc;
use std::time::Duration;

fn runtime(workers: usize) -> Runtime {
    Runtime::builder()
        .config(RuntimeConfig::default().with_wake_timeout_ms(5).with_task_ttl(1))
        .workers(workers)
        .memory_probe(Arc::new(FixedMemoryProbe::new(10)))
        .build()
        .unwrap()
}

fn bench_submit_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_run");
    for tasks in [16usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            let rt = runtime(4);
            b.iter(|| {
                for i in 0..tasks as i64 {
                    rt.submit(
                        Work::new(|ctx, args| {
                            let block = ctx.alloc(64, 8)?;
                            black_box(block);
                            Ok(args.get(0).cloned().unwrap_or_default())
                        })
                        .with_args(Args::new().arg(i)),
                    )
                    .unwrap();
                }
                rt.run().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_waits(c: &mut Criterion) {
    c.bench_function("wait_set_run", |b| {
        let rt = runtime(2);
        b.iter(|| {
            let event = Event::new();
            for _ in 0..32 {
                rt.submit_wait(&event, None, Work::new(|_, _| Ok(Value::None)))
                    .unwrap();
            }
            event.set();
            rt.run().unwrap();
        });
    });
}

fn bench_timers(c: &mut Criterion) {
    c.bench_function("timer_zero_delay", |b| {
        let rt = runtime(2);
        b.iter(|| {
            rt.submit_timer(Duration::ZERO, Work::new(|_, _| Ok(Value::None)))
                .unwrap();
            rt.run().unwrap();
        });
    });
}

criterion_group!(benches, bench_submit_run, bench_waits, bench_timers);
criterion_main!(benches);
