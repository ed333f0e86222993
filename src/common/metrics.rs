//! Injected metrics collector
//!
//! One collector is created per analysis run and handed to the components
//! that report into it. Process-level figures come from a [`SystemProbe`];
//! builds or platforms without a usable probe get [`NoopProbe`] and the
//! pipeline never branches on platform itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;
use tracing::trace;

/// Capability interface for OS-level process counters
pub trait SystemProbe: Send + Sync {
    /// Resident memory of the current process in bytes, if available
    fn resident_memory_bytes(&self) -> Option<u64>;
}

/// Probe backed by `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<sysinfo::Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn resident_memory_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_all();
        system.process(pid).map(|p| p.memory())
    }
}

/// Probe for platforms where process counters are unavailable
pub struct NoopProbe;

impl SystemProbe for NoopProbe {
    fn resident_memory_bytes(&self) -> Option<u64> {
        None
    }
}

/// Pick the best probe for the current platform
pub fn default_probe() -> Box<dyn SystemProbe> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Box::new(SysinfoProbe::new())
    } else {
        Box::new(NoopProbe)
    }
}

/// Read-only snapshot of collected metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub timings_ms: BTreeMap<String, u64>,
    pub counters: BTreeMap<String, u64>,
    pub peak_memory_bytes: Option<u64>,
}

/// Named timings and counters for one run
pub struct MetricsCollector {
    timings: DashMap<String, Duration>,
    counters: DashMap<String, AtomicU64>,
    peak_memory: AtomicU64,
    probe: Box<dyn SystemProbe>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(default_probe())
    }
}

impl MetricsCollector {
    pub fn new(probe: Box<dyn SystemProbe>) -> Self {
        Self {
            timings: DashMap::new(),
            counters: DashMap::new(),
            peak_memory: AtomicU64::new(0),
            probe,
        }
    }

    /// Collector that never touches OS counters
    pub fn noop() -> Self {
        Self::new(Box::new(NoopProbe))
    }

    pub fn record_duration(&self, name: &str, elapsed: Duration) {
        trace!(name, elapsed_ms = elapsed.as_millis() as u64, "Recorded timing");
        self.timings.insert(name.to_string(), elapsed);
    }

    pub fn increment(&self, name: &str, by: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(by, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sample process memory and keep the high-water mark
    pub fn sample_memory(&self) -> Option<u64> {
        let bytes = self.probe.resident_memory_bytes()?;
        self.peak_memory.fetch_max(bytes, Ordering::Relaxed);
        Some(bytes)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let peak = self.peak_memory.load(Ordering::Relaxed);
        MetricsSnapshot {
            timings_ms: self
                .timings
                .iter()
                .map(|e| (e.key().clone(), e.value().as_millis() as u64))
                .collect(),
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            peak_memory_bytes: (peak > 0).then_some(peak),
        }
    }
}
