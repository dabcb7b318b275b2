//! Memory-load sampling for backpressure

use crate::config::MemoryConfig;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Source of the system memory load, in percent.
pub trait MemoryProbe: Send + Sync {
    fn load_percent(&self) -> io::Result<u8>;
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    #[cfg(target_os = "linux")]
    fn load_percent(&self) -> io::Result<u8> {
        let text = std::fs::read_to_string("/proc/meminfo")?;
        parse_meminfo(&text).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "meminfo lacks MemTotal/MemAvailable")
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn load_percent(&self) -> io::Result<u8> {
        Ok(0)
    }
}

fn parse_meminfo(text: &str) -> Option<u8> {
    let field = |name: &str| {
        text.lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(((used * 100) / total).min(100) as u8)
}

/// A probe reporting whatever it was last set to.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    load: AtomicU8,
}

impl FixedMemoryProbe {
    pub fn new(load: u8) -> Self {
        Self {
            load: AtomicU8::new(load.min(100)),
        }
    }

    pub fn set(&self, load: u8) {
        self.load.store(load.min(100), Ordering::Release);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn load_percent(&self) -> io::Result<u8> {
        Ok(self.load.load(Ordering::Acquire))
    }
}

/// Cached load plus the configured thresholds.
pub(crate) struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    soft: u8,
    hard: u8,
    load: AtomicU8,
}

impl MemoryMonitor {
    pub fn new(probe: Arc<dyn MemoryProbe>, config: &MemoryConfig) -> Self {
        Self {
            probe,
            soft: config.soft_limit,
            hard: config.hard_limit,
            load: AtomicU8::new(0),
        }
    }

    /// Sample the probe. A failed sample keeps the previous value.
    pub fn refresh(&self) -> u8 {
        match self.probe.load_percent() {
            Ok(load) => {
                let previous = self.load.swap(load, Ordering::AcqRel);
                if load >= self.hard && previous < self.hard {
                    tracing::warn!(target: "pump", load, limit = self.hard, "memory load above hard limit");
                }
                load
            }
            Err(err) => {
                tracing::debug!(target: "pump", error = %err, "memory probe failed");
                self.load()
            }
        }
    }

    pub fn load(&self) -> u8 {
        self.load.load(Ordering::Acquire)
    }

    pub fn above_soft(&self) -> bool {
        self.load() >= self.soft
    }

    pub fn above_hard(&self) -> bool {
        self.load() >= self.hard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert_eq!(parse_meminfo(text), Some(75));
        assert_eq!(parse_meminfo("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn test_monitor_thresholds() {
        let probe = Arc::new(FixedMemoryProbe::new(10));
        let monitor = MemoryMonitor::new(probe.clone(), &MemoryConfig::default());
        monitor.refresh();
        assert!(!monitor.above_soft());

        probe.set(80);
        monitor.refresh();
        assert!(monitor.above_soft());
        assert!(!monitor.above_hard());

        probe.set(95);
        assert_eq!(monitor.refresh(), 95);
        assert!(monitor.above_hard());
    }
}
