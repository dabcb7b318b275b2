//! Counters, stats snapshots and timing metrics

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Most recent samples kept per timing metric.
const MAX_SAMPLES: usize = 4096;

/// Category a submitted unit of work is counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Work,
    Io,
    Wait,
    Timer,
    SyncWait,
    SyncNoWait,
}

impl WorkKind {
    pub const ALL: [WorkKind; 6] = [
        WorkKind::Work,
        WorkKind::Io,
        WorkKind::Wait,
        WorkKind::Timer,
        WorkKind::SyncWait,
        WorkKind::SyncNoWait,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Io => "io",
            Self::Wait => "wait",
            Self::Timer => "timer",
            Self::SyncWait => "sync_wait",
            Self::SyncNoWait => "sync_nowait",
        }
    }
}

/// Submitted/pending/inflight/done counts for one kind.
#[derive(Debug, Default)]
pub struct KindCounters {
    pub submitted: AtomicU64,
    pub pending: AtomicU64,
    pub inflight: AtomicU64,
    pub done: AtomicU64,
    pub errors: AtomicU64,
}

impl KindCounters {
    pub fn submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn start(&self) {
        dec(&self.pending);
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn finish(&self, failed: bool) {
        dec(&self.inflight);
        self.done.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pending work that never started (cancelled at shutdown or refused).
    pub fn abandon(&self) {
        dec(&self.pending);
    }

    pub fn snapshot(&self) -> KindStats {
        KindStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Acquire),
            inflight: self.inflight.load(Ordering::Acquire),
            done: self.done.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

fn dec(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

/// Engine-wide atomic counters.
#[derive(Debug, Default)]
pub struct Counters {
    kinds: [KindCounters; 6],

    pub tasks_created: AtomicU64,
    pub tasks_active: AtomicU64,
    pub tasks_persisted: AtomicU64,
    pub tasks_destroyed: AtomicU64,
    pub tasks_recycled: AtomicU64,
    pub errors_raised: AtomicU64,
    pub callbacks_completed: AtomicU64,
    pub errbacks_completed: AtomicU64,

    pub active_ioloops: AtomicU64,
    pub active_hogs: AtomicU64,
    pub accepts_posted: AtomicU64,
    pub connections_reaped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    pub memory_load: AtomicU8,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(&self, kind: WorkKind) -> &KindCounters {
        &self.kinds[kind.index()]
    }

    pub fn active(&self) -> u64 {
        self.tasks_active.load(Ordering::Acquire)
    }

    pub fn persisted(&self) -> u64 {
        self.tasks_persisted.load(Ordering::Acquire)
    }

    /// Submitted work that has not reached `done`.
    pub fn outstanding(&self) -> u64 {
        self.kinds
            .iter()
            .map(|k| k.pending.load(Ordering::Acquire) + k.inflight.load(Ordering::Acquire))
            .sum()
    }

    pub fn submitted(&self) -> u64 {
        self.kinds.iter().map(|k| k.submitted.load(Ordering::Relaxed)).sum()
    }

    pub(crate) fn task_deactivated(&self) {
        dec(&self.tasks_active);
    }

    pub(crate) fn persisted_released(&self) {
        dec(&self.tasks_persisted);
    }

    pub(crate) fn ioloop_exit(&self) {
        dec(&self.active_ioloops);
    }

    pub(crate) fn hog_cleared(&self) {
        dec(&self.active_hogs);
    }
}

/// Point-in-time copy of one kind's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub submitted: u64,
    pub pending: u64,
    pub inflight: u64,
    pub done: u64,
    pub errors: u64,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub workers: usize,
    pub tasks_created: u64,
    pub tasks_active: u64,
    pub tasks_persisted: u64,
    pub tasks_destroyed: u64,
    pub tasks_recycled: u64,
    pub errors_raised: u64,
    pub callbacks_completed: u64,
    pub errbacks_completed: u64,
    pub kinds: HashMap<&'static str, KindStats>,
    pub memory_load: u8,
    pub active_ioloops: u64,
    pub active_hogs: u64,
    pub accepts_posted: u64,
    pub connections_reaped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_ms: u64,
}

impl RuntimeStats {
    pub fn collect(counters: &Counters, workers: usize, uptime: Duration) -> Self {
        let load = |c: &AtomicU64| c.load(Ordering::Acquire);
        Self {
            workers,
            tasks_created: load(&counters.tasks_created),
            tasks_active: load(&counters.tasks_active),
            tasks_persisted: load(&counters.tasks_persisted),
            tasks_destroyed: load(&counters.tasks_destroyed),
            tasks_recycled: load(&counters.tasks_recycled),
            errors_raised: load(&counters.errors_raised),
            callbacks_completed: load(&counters.callbacks_completed),
            errbacks_completed: load(&counters.errbacks_completed),
            kinds: WorkKind::ALL
                .iter()
                .map(|&kind| (kind.name(), counters.kind(kind).snapshot()))
                .collect(),
            memory_load: counters.memory_load.load(Ordering::Relaxed),
            active_ioloops: load(&counters.active_ioloops),
            active_hogs: load(&counters.active_hogs),
            accepts_posted: load(&counters.accepts_posted),
            connections_reaped: load(&counters.connections_reaped),
            bytes_sent: load(&counters.bytes_sent),
            bytes_received: load(&counters.bytes_received),
            uptime_ms: uptime.as_millis() as u64,
        }
    }

    pub fn kind(&self, kind: WorkKind) -> KindStats {
        self.kinds.get(kind.name()).copied().unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Timing collector for task execution and pump cycles.
pub struct PerformanceMetrics {
    timings: RwLock<HashMap<&'static str, Vec<Duration>>>,
    start_time: Instant,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            timings: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record a timing measurement, keeping the newest samples.
    pub fn record_timing(&self, name: &'static str, duration: Duration) {
        let mut timings = self.timings.write();
        let samples = timings.entry(name).or_default();
        if samples.len() == MAX_SAMPLES {
            samples.remove(0);
        }
        samples.push(duration);
    }

    pub fn get_timing_stats(&self, name: &str) -> Option<TimingStats> {
        self.timings.read().get(name).map(|d| TimingStats::from_durations(d))
    }

    pub fn timing_names(&self) -> Vec<&'static str> {
        self.timings.read().keys().copied().collect()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn reset(&self) {
        self.timings.write().clear();
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for timing measurements
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingStats {
    pub count: usize,
    pub total: Duration,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl TimingStats {
    fn from_durations(durations: &[Duration]) -> Self {
        if durations.is_empty() {
            return Self {
                count: 0,
                total: Duration::ZERO,
                mean: Duration::ZERO,
                min: Duration::ZERO,
                max: Duration::ZERO,
                p50: Duration::ZERO,
                p95: Duration::ZERO,
                p99: Duration::ZERO,
            };
        }

        let mut sorted = durations.to_vec();
        sorted.sort();

        let count = sorted.len();
        let total: Duration = sorted.iter().sum();
        let mean = total / count as u32;

        let percentile = |p: f64| {
            let idx = ((count as f64 * p) as usize).min(count - 1);
            sorted[idx]
        };

        Self {
            count,
            total,
            mean,
            min: sorted[0],
            max: sorted[count - 1],
            p50: percentile(0.50),
            p95: percentile(0.95),
            p99: percentile(0.99),
        }
    }
}

/// RAII timer for automatic timing measurement
pub struct Timer<'a> {
    metrics: &'a PerformanceMetrics,
    name: &'static str,
    start: Instant,
}

impl<'a> Timer<'a> {
    pub fn new(metrics: &'a PerformanceMetrics, name: &'static str) -> Self {
        Self {
            metrics,
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.metrics.record_timing(self.name, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_kind_counter_flow() {
        let counters = Counters::new();
        let work = counters.kind(WorkKind::Work);

        work.submit();
        work.submit();
        assert_eq!(counters.outstanding(), 2);

        work.start();
        work.finish(false);
        work.start();
        work.finish(true);

        let stats = work.snapshot();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.done, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(counters.outstanding(), 0);
    }

    #[test]
    fn test_counters_never_underflow() {
        let counters = Counters::new();
        counters.task_deactivated();
        counters.kind(WorkKind::Io).abandon();
        assert_eq!(counters.active(), 0);
        assert_eq!(counters.kind(WorkKind::Io).snapshot().pending, 0);
    }

    #[test]
    fn test_stats_serialize() {
        let counters = Counters::new();
        counters.kind(WorkKind::Timer).submit();
        counters.tasks_created.fetch_add(1, Ordering::Relaxed);

        let stats = RuntimeStats::collect(&counters, 4, Duration::from_millis(5));
        assert_eq!(stats.kind(WorkKind::Timer).pending, 1);

        let json = stats.to_json();
        assert!(json.contains("\"tasks_created\": 1"));
        assert!(json.contains("\"timer\""));
    }

    #[test]
    fn test_timing() {
        let metrics = PerformanceMetrics::new();

        metrics.record_timing("task", Duration::from_millis(100));
        metrics.record_timing("task", Duration::from_millis(200));
        metrics.record_timing("task", Duration::from_millis(150));

        let stats = metrics.get_timing_stats("task").unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::from_millis(100));
        assert_eq!(stats.max, Duration::from_millis(200));
        assert_eq!(stats.p50, Duration::from_millis(150));
    }

    #[test]
    fn test_samples_are_capped() {
        let metrics = PerformanceMetrics::new();
        for i in 0..(MAX_SAMPLES + 10) {
            metrics.record_timing("cycle", Duration::from_micros(i as u64));
        }
        let stats = metrics.get_timing_stats("cycle").unwrap();
        assert_eq!(stats.count, MAX_SAMPLES);
        assert_eq!(stats.min, Duration::from_micros(10));
    }

    #[test]
    fn test_timer() {
        let metrics = PerformanceMetrics::new();

        {
            let _timer = Timer::new(&metrics, "sleep");
            thread::sleep(Duration::from_millis(10));
        }

        let stats = metrics.get_timing_stats("sleep").unwrap();
        assert_eq!(stats.count, 1);
        assert!(stats.total >= Duration::from_millis(10));
    }
}
