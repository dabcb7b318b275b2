//! Logging infrastructure - structured tracing for the allocator
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels from the environment
//! - Zero-cost when disabled
//! - Event helpers for page growth, snapshots and rollbacks
//!
//! Events are emitted under the `allocator` and `snapshot` targets.

use once_cell::sync::OnceCell;
use std::io;
use tracing::{debug, error, trace, Level};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // PXENGINE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("PXENGINE_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        config.json_format = std::env::var("PXENGINE_LOG_JSON").is_ok();
        config.show_spans = std::env::var("PXENGINE_LOG_SPANS").is_ok();

        config
    }

    /// Create debug config (verbose logging)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration from the environment
pub fn init_runtime_logging() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// A subscriber installed elsewhere wins; this never panics.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = config.level.as_str().to_lowercase();
            EnvFilter::new(format!(
                "pxengine_runtime={level},allocator={level},snapshot={level}"
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer = fmt::layer()
            .with_writer(io::stderr)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions));

        let result = if config.json_format {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init()
        };
        if result.is_err() {
            debug!(target: "allocator", "subscriber already installed");
        }
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Allocator events
// ============================================================================

/// Log a new page linked into an arena
#[inline]
pub fn log_page_grow(owner: u64, bytes: usize, pages: usize) {
    trace!(
        target: "allocator",
        event = "page_grow",
        owner,
        size_bytes = bytes,
        pages,
        "Arena page linked"
    );
}

/// Log a failed page acquisition
pub fn log_out_of_memory(owner: u64, bytes: usize) {
    error!(
        target: "allocator",
        event = "out_of_memory",
        owner,
        size_bytes = bytes,
        "Arena could not grow"
    );
}

/// Log creation of a thread-local heap
pub fn log_tls_heap_init(bytes: usize) {
    debug!(
        target: "allocator",
        event = "tls_heap_init",
        size_bytes = bytes,
        thread = ?std::thread::current().id(),
        "Thread-local heap created"
    );
}

/// Log a snapshot being opened
#[inline]
pub fn log_snapshot_take(owner: u64, id: u64, depth: usize) {
    trace!(
        target: "snapshot",
        event = "snapshot_take",
        owner,
        snapshot = id,
        depth,
        "Snapshot taken"
    );
}

/// Log a rollback
#[inline]
pub fn log_rollback(owner: u64, id: u64, reclaimed: usize) {
    trace!(
        target: "snapshot",
        event = "rollback",
        owner,
        snapshot = id,
        reclaimed_bytes = reclaimed,
        "Snapshot rolled back"
    );
}

/// Log snapshot slot exhaustion
pub fn log_snapshots_exhausted(owner: u64) {
    error!(
        target: "snapshot",
        event = "snapshots_exhausted",
        owner,
        "No free snapshot slots"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            debug!(
                operation = self.operation,
                duration_us = self.start.elapsed().as_micros() as u64,
                "operation completed"
            );
        }
    }
}

/// Time a block, logging its duration at debug level when it ends.
#[macro_export]
macro_rules! time_block {
    ($name:expr, $body:block) => {{
        let _guard = $crate::logging::perf::track($name);
        $body
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json_format);

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
        assert!(debug_config.show_spans);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), Level::TRACE);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_init_idempotent() {
        init_runtime_logging();
        init_runtime_logging(); // Should not panic
        assert!(is_initialized());
    }

    #[test]
    fn test_time_block_returns_value() {
        let v = crate::time_block!("sum", { 2 + 3 });
        assert_eq!(v, 5);
    }
}
