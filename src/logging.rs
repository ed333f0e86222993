//! Logging and tracing configuration for capflow
//!
//! This module provides structured logging using the `tracing` crate.
//!
//! # Usage
//!
//! Initialize logging at startup:
//! ```rust
//! capflow::logging::init();
//! ```
//!
//! # Log Levels
//!
//! - `error` - Errors that abort an analysis run
//! - `warn`  - Contained failures (bad packet, failed pool reset, teardown timeouts)
//! - `info`  - Stage transitions and run summaries (default in release)
//! - `debug` - Per-component detail (default in debug builds)
//! - `trace` - Per-packet / per-block detail
//!
//! # Environment Variable Control
//!
//! ```bash
//! RUST_LOG=debug capflow analyze dump.pcapng
//! RUST_LOG=capflow::ingest=trace,capflow::cache=debug capflow analyze dump.pcap
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging/tracing system
///
/// Call this once at startup (in main.rs). With the `debug-logging`
/// feature enabled this delegates to [`init_verbose`].
pub fn init() {
    if cfg!(feature = "debug-logging") {
        init_verbose();
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("capflow=debug")
        } else {
            EnvFilter::new("capflow=info")
        }
    });

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact(),
    );

    // Ignore error if already set
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize logging with verbose output (file:line, thread IDs)
///
/// Worker-pool output is much easier to follow with thread ids visible.
pub fn init_verbose() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .pretty(),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Check if debug logging is enabled
/// Can be used to skip expensive debug computations
#[inline]
pub fn is_debug_enabled() -> bool {
    tracing::enabled!(Level::DEBUG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_noop() {
        init();
        init();
        tracing::info!("Test log message");
        tracing::debug!(key = "value", "Structured log");
        let _ = is_debug_enabled();
    }
}
