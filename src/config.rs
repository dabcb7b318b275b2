//! Runtime configuration
//!
//! Loaded from TOML (`[pool]`, `[heap]`, `[memory]`, `[net]` sections, every
//! field optional) and overridable from `PXENGINE_*` environment variables.

use crate::errors::{PxError, Result};
use pxengine_runtime::ArenaConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub heap: HeapConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub net: NetConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker threads; 0 = one per CPU.
    #[serde(default)]
    pub workers: usize,

    /// Longest the pump blocks on the wake signal.
    #[serde(default = "default_wake_timeout_ms")]
    pub wake_timeout_ms: u64,

    /// Pump cycles a released task lingers before it is destroyed.
    #[serde(default = "default_task_ttl")]
    pub task_ttl: u8,

    /// Timeout for a worker's synchronous call into the controlling thread.
    #[serde(default = "default_sync_wait_timeout_ms")]
    pub sync_wait_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapConfig {
    #[serde(default = "default_heap_size")]
    pub default_heap_size: usize,

    /// 0 = OS page size.
    #[serde(default)]
    pub page_size: usize,

    #[serde(default = "default_heap_size")]
    pub tls_heap_size: usize,

    #[serde(default = "default_true")]
    pub zero_on_rollback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Load (percent) at which idle connections are recycled.
    #[serde(default = "default_soft_limit")]
    pub soft_limit: u8,

    /// Load (percent) at which new tasks and accepts are refused.
    #[serde(default = "default_hard_limit")]
    pub hard_limit: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default = "default_heap_size")]
    pub recv_buffer_size: usize,

    #[serde(default = "default_sync_attempts")]
    pub max_sync_send_attempts: u32,

    #[serde(default = "default_sync_attempts")]
    pub max_sync_recv_attempts: u32,

    /// Pooled accepts per listener; 0 = twice the CPU count.
    #[serde(default)]
    pub accepts_to_post: usize,

    /// Consecutive synchronous completions before a connection is a hog.
    #[serde(default = "default_hog_threshold")]
    pub hog_threshold: u32,

    /// Idle time after which a receiving connection may be reaped; 0 = any idle one.
    #[serde(default = "default_idle_reap_after_ms")]
    pub idle_reap_after_ms: u64,

    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,

    /// Longest line a lines-mode connection buffers before it is faulted.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            wake_timeout_ms: default_wake_timeout_ms(),
            task_ttl: default_task_ttl(),
            sync_wait_timeout_ms: default_sync_wait_timeout_ms(),
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            default_heap_size: default_heap_size(),
            page_size: 0,
            tls_heap_size: default_heap_size(),
            zero_on_rollback: true,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            soft_limit: default_soft_limit(),
            hard_limit: default_hard_limit(),
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: default_heap_size(),
            max_sync_send_attempts: default_sync_attempts(),
            max_sync_recv_attempts: default_sync_attempts(),
            accepts_to_post: 0,
            hog_threshold: default_hog_threshold(),
            idle_reap_after_ms: default_idle_reap_after_ms(),
            listen_backlog: default_listen_backlog(),
            max_line_length: default_max_line_length(),
        }
    }
}

fn default_true() -> bool { true }
fn default_wake_timeout_ms() -> u64 { 1000 }
fn default_task_ttl() -> u8 { 1 }
fn default_sync_wait_timeout_ms() -> u64 { 30_000 }
fn default_heap_size() -> usize { 64 * 1024 }
fn default_soft_limit() -> u8 { 75 }
fn default_hard_limit() -> u8 { 90 }
fn default_sync_attempts() -> u32 { 8 }
fn default_hog_threshold() -> u32 { 16 }
fn default_idle_reap_after_ms() -> u64 { 30_000 }
fn default_listen_backlog() -> i32 { 1024 }
fn default_max_line_length() -> usize { 1024 * 1024 }

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| PxError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `PXENGINE_WORKERS`, `PXENGINE_TASK_TTL`,
    /// `PXENGINE_SOFT_MEMORY_LIMIT` and `PXENGINE_HARD_MEMORY_LIMIT`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse("PXENGINE_WORKERS")? {
            self.pool.workers = v;
        }
        if let Some(v) = env_parse("PXENGINE_TASK_TTL")? {
            self.pool.task_ttl = v;
        }
        if let Some(v) = env_parse("PXENGINE_SOFT_MEMORY_LIMIT")? {
            self.memory.soft_limit = v;
        }
        if let Some(v) = env_parse("PXENGINE_HARD_MEMORY_LIMIT")? {
            self.memory.hard_limit = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=4).contains(&self.pool.task_ttl) {
            return Err(PxError::Config(format!(
                "pool.task_ttl must be within 1..=4, got {}",
                self.pool.task_ttl
            )));
        }
        if self.pool.wake_timeout_ms == 0 {
            return Err(PxError::Config("pool.wake_timeout_ms must be positive".into()));
        }
        if self.memory.soft_limit >= self.memory.hard_limit || self.memory.hard_limit > 100 {
            return Err(PxError::Config(format!(
                "memory limits must satisfy soft < hard <= 100, got {} / {}",
                self.memory.soft_limit, self.memory.hard_limit
            )));
        }
        if self.heap.default_heap_size == 0 || self.heap.tls_heap_size == 0 {
            return Err(PxError::Config("heap sizes must be positive".into()));
        }
        if self.heap.page_size != 0 && !self.heap.page_size.is_power_of_two() {
            return Err(PxError::Config(format!(
                "heap.page_size must be a power of two, got {}",
                self.heap.page_size
            )));
        }
        if self.net.recv_buffer_size == 0 {
            return Err(PxError::Config("net.recv_buffer_size must be positive".into()));
        }
        if self.net.max_line_length == 0 {
            return Err(PxError::Config("net.max_line_length must be positive".into()));
        }
        Ok(())
    }

    /// Worker count with 0 resolved to the CPU count.
    pub fn worker_count(&self) -> usize {
        match self.pool.workers {
            0 => cpu_count(),
            n => n,
        }
    }

    /// Pooled accepts per listener with 0 resolved.
    pub fn accepts_to_post(&self) -> usize {
        match self.net.accepts_to_post {
            0 => cpu_count() * 2,
            n => n,
        }
    }

    pub fn wake_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.wake_timeout_ms)
    }

    pub fn sync_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.sync_wait_timeout_ms)
    }

    /// Arena sizing for task heaps.
    pub fn task_arena(&self) -> ArenaConfig {
        ArenaConfig::new()
            .with_default_size(self.heap.default_heap_size)
            .with_page_size(self.heap.page_size)
            .with_zero_on_rollback(self.heap.zero_on_rollback)
    }

    /// Arena sizing for worker-thread heaps.
    pub fn tls_arena(&self) -> ArenaConfig {
        self.task_arena().with_default_size(self.heap.tls_heap_size)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool.workers = workers;
        self
    }

    pub fn with_task_ttl(mut self, ttl: u8) -> Self {
        self.pool.task_ttl = ttl;
        self
    }

    pub fn with_wake_timeout_ms(mut self, ms: u64) -> Self {
        self.pool.wake_timeout_ms = ms;
        self
    }

    pub fn with_memory_limits(mut self, soft: u8, hard: u8) -> Self {
        self.memory.soft_limit = soft;
        self.memory.hard_limit = hard;
        self
    }

    pub fn with_net(mut self, net: NetConfig) -> Self {
        self.net = net;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PxError::Config(format!("{} has an invalid value: {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Logical CPUs available to this process.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.pool.task_ttl, 1);
        assert_eq!(config.pool.wake_timeout_ms, 1000);
        assert_eq!(config.memory.soft_limit, 75);
        assert_eq!(config.memory.hard_limit, 90);
        assert_eq!(config.heap.default_heap_size, 64 * 1024);
        assert!(config.heap.zero_on_rollback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [pool]
            workers = 3

            [net]
            max_sync_send_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.net.max_sync_send_attempts, 2);
        assert_eq!(config.net.max_sync_recv_attempts, 8);
        assert_eq!(config.memory.hard_limit, 90);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("[pool]\ntask_ttl = 9\n"),
            Err(PxError::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("[memory]\nsoft_limit = 95\nhard_limit = 90\n"),
            Err(PxError::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("[heap]\npage_size = 3000\n"),
            Err(PxError::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("[pool\n"),
            Err(PxError::Config(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pxengine.toml");
        std::fs::write(&path, "[memory]\nsoft_limit = 50\nhard_limit = 60\n").unwrap();
        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.memory.soft_limit, 50);
        assert!(RuntimeConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = RuntimeConfig::default().with_workers(2).with_task_ttl(3);
        let text = toml::to_string(&config).unwrap();
        assert_eq!(RuntimeConfig::from_toml_str(&text).unwrap(), config);
    }
}
