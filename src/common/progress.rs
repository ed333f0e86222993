//! Progress reporting surface shared by the inspector and the orchestrator
//!
//! Consumers (UI layers, the CLI) receive plain [`ProgressUpdate`] values
//! through a callback; nothing here knows how they are rendered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Callback invoked with each progress update
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// One progress observation
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    /// Phase name ("counting", "loading", ...)
    pub phase: String,
    /// Percent complete, 0-100
    pub percent: f64,
    /// Items processed so far
    pub processed: u64,
    /// Total item estimate (0 when unknown)
    pub total: u64,
    pub elapsed_ms: u64,
    /// Items per second
    pub throughput: f64,
    /// Estimated time remaining
    pub eta_ms: Option<u64>,
}

impl ProgressUpdate {
    /// Build an update, deriving percent, throughput and ETA
    pub fn new(phase: &str, processed: u64, total: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 { processed as f64 / secs } else { 0.0 };
        let percent = if total > 0 {
            (processed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let eta_ms = if throughput > 0.0 && total > processed {
            Some(((total - processed) as f64 / throughput * 1000.0) as u64)
        } else {
            None
        };

        Self {
            phase: phase.to_string(),
            percent,
            processed,
            total,
            elapsed_ms: elapsed.as_millis() as u64,
            throughput,
            eta_ms,
        }
    }

    /// Override the percent (used when a phase maps onto a slice of overall progress)
    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent = percent.clamp(0.0, 100.0);
        self
    }
}

/// Rate limiter for progress callbacks
///
/// `ready()` returns true at most once per interval; the first call is
/// always ready so consumers see an initial update immediately.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
