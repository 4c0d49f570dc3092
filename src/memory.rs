//! Memory-pressure monitoring.
//!
//! A background thread samples memory usage and fires the registered cleanup
//! callbacks with the current pressure level. It never touches jobs directly;
//! stages consult [`MemoryMonitor::bounded_population`] and
//! [`MemoryMonitor::sustained_emergency`] at their safe points.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::MemoryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PressureLevel {
    Normal = 0,
    /// Routine cleanup: drop expired cache entries.
    Elevated = 1,
    /// Aggressive cleanup: shrink populations, evict more.
    Aggressive = 2,
    /// Emergency cleanup: clear caches; jobs fail if it persists.
    Emergency = 3,
}

impl PressureLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Elevated,
            2 => PressureLevel::Aggressive,
            _ => PressureLevel::Emergency,
        }
    }
}

/// Where usage readings come from.
pub trait MemorySource: Send + Sync {
    /// Used fraction of memory in [0, 1], or `None` if unknown.
    fn usage_ratio(&self) -> Option<f64>;
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo`.
#[derive(Debug, Default)]
pub struct ProcMeminfo;

impl MemorySource for ProcMeminfo {
    fn usage_ratio(&self) -> Option<f64> {
        let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo(&raw)
    }
}

fn parse_meminfo(raw: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        raw.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total).clamp(0.0, 1.0))
}

/// Settable reading, for simulations and tests.
#[derive(Debug)]
pub struct FixedMemorySource {
    ratio: Mutex<f64>,
}

impl FixedMemorySource {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: Mutex::new(ratio),
        }
    }

    pub fn set(&self, ratio: f64) {
        *self.ratio.lock().unwrap_or_else(|p| p.into_inner()) = ratio;
    }
}

impl MemorySource for FixedMemorySource {
    fn usage_ratio(&self) -> Option<f64> {
        Some(*self.ratio.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

pub type CleanupCallback = Box<dyn Fn(PressureLevel) + Send + Sync>;

pub struct MemoryMonitor {
    source: Arc<dyn MemorySource>,
    config: MemoryConfig,
    level: AtomicU8,
    emergency_streak: AtomicU32,
    callbacks: Mutex<Vec<(String, CleanupCallback)>>,
    stop: AtomicBool,
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("level", &self.level())
            .field("emergency_streak", &self.emergency_streak.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryMonitor {
    pub fn new(source: Arc<dyn MemorySource>, config: MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            source,
            config,
            level: AtomicU8::new(PressureLevel::Normal as u8),
            emergency_streak: AtomicU32::new(0),
            callbacks: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        })
    }

    /// Monitor over the host's `/proc/meminfo`.
    pub fn system(config: MemoryConfig) -> Arc<Self> {
        Self::new(Arc::new(ProcMeminfo), config)
    }

    pub fn register(&self, name: impl Into<String>, callback: CleanupCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((name.into(), callback));
    }

    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.level.load(Ordering::SeqCst))
    }

    pub fn classify(&self, ratio: f64) -> PressureLevel {
        if ratio >= self.config.emergency_ratio {
            PressureLevel::Emergency
        } else if ratio >= self.config.aggressive_ratio {
            PressureLevel::Aggressive
        } else if ratio >= self.config.elevated_ratio {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }

    /// Takes one reading and runs cleanup for anything above normal.
    pub fn poll_once(&self) -> PressureLevel {
        let Some(ratio) = self.source.usage_ratio() else {
            return self.level();
        };
        let level = self.classify(ratio);
        let previous = PressureLevel::from_u8(self.level.swap(level as u8, Ordering::SeqCst));
        if level == PressureLevel::Emergency {
            let streak = self.emergency_streak.fetch_add(1, Ordering::SeqCst) + 1;
            error!("Memory usage {:.0}% (emergency, streak {streak})", ratio * 100.0);
        } else {
            self.emergency_streak.store(0, Ordering::SeqCst);
            if level != previous {
                info!("Memory pressure {previous:?} -> {level:?} ({:.0}%)", ratio * 100.0);
            }
        }
        if level > PressureLevel::Normal {
            let callbacks = self.callbacks.lock().unwrap_or_else(|p| p.into_inner());
            for (name, callback) in callbacks.iter() {
                debug!("running {level:?} cleanup '{name}'");
                callback(level);
            }
        }
        level
    }

    /// Population size allowed under the current pressure.
    pub fn bounded_population(&self, default: usize) -> usize {
        let bounded = match self.level() {
            PressureLevel::Normal | PressureLevel::Elevated => default,
            PressureLevel::Aggressive => default / 2,
            PressureLevel::Emergency => default / 4,
        };
        bounded.max(2).min(default)
    }

    /// Emergency readings persisted past the configured number of polls.
    pub fn sustained_emergency(&self) -> bool {
        self.emergency_streak.load(Ordering::SeqCst) >= self.config.emergency_polls
    }

    /// Starts the sampling thread.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let monitor = Arc::clone(self);
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(10));
        std::thread::Builder::new()
            .name("memory-monitor".into())
            .spawn(move || {
                while !monitor.stop.load(Ordering::SeqCst) {
                    monitor.poll_once();
                    std::thread::sleep(interval);
                }
                debug!("memory monitor stopped");
            })
    }

    pub fn shutdown(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            warn!("memory monitor shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_parse_meminfo() {
        let raw = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        let ratio = parse_meminfo(raw).unwrap();
        assert!((ratio - 0.75).abs() < 1e-9);
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn test_ninety_percent_triggers_aggressive_cleanup() {
        let source = Arc::new(FixedMemorySource::new(0.90));
        let monitor = MemoryMonitor::new(source, MemoryConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let fired = Arc::clone(&fired);
            let seen = Arc::clone(&seen);
            monitor.register(
                "probe",
                Box::new(move |level| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    seen.lock().unwrap().push(level);
                }),
            );
        }
        assert_eq!(monitor.poll_once(), PressureLevel::Aggressive);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap()[0], PressureLevel::Aggressive);
        assert!(monitor.bounded_population(60) < 60);
    }

    #[test]
    fn test_normal_pressure_runs_no_cleanup() {
        let monitor = MemoryMonitor::new(Arc::new(FixedMemorySource::new(0.3)), MemoryConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        monitor.register("probe", Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(monitor.poll_once(), PressureLevel::Normal);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.bounded_population(60), 60);
    }

    #[test]
    fn test_sustained_emergency_needs_consecutive_polls() {
        let source = Arc::new(FixedMemorySource::new(0.97));
        let monitor = MemoryMonitor::new(source.clone(), MemoryConfig::default());
        monitor.poll_once();
        monitor.poll_once();
        assert!(!monitor.sustained_emergency());
        source.set(0.5);
        monitor.poll_once();
        source.set(0.97);
        monitor.poll_once();
        monitor.poll_once();
        assert!(!monitor.sustained_emergency());
        monitor.poll_once();
        assert!(monitor.sustained_emergency());
        assert_eq!(monitor.bounded_population(60), 15);
    }

    #[test]
    fn test_background_thread_samples() {
        let config = MemoryConfig {
            poll_interval_ms: 10,
            ..MemoryConfig::default()
        };
        let monitor = MemoryMonitor::new(Arc::new(FixedMemorySource::new(0.8)), config);
        let handle = monitor.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(monitor.level(), PressureLevel::Elevated);
        monitor.shutdown();
        handle.join().unwrap();
    }
}
