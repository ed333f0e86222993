//! Notifications and statistics published by the stream processor

use serde::Serialize;

/// Lifecycle of a [`super::StreamProcessor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ProcessorState {
    Idle = 0,
    Processing = 1,
    /// Writer side completed; workers are finishing the backlog
    Draining = 2,
    Stopped = 3,
}

impl ProcessorState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessorState::Idle,
            1 => ProcessorState::Processing,
            2 => ProcessorState::Draining,
            _ => ProcessorState::Stopped,
        }
    }
}

/// Per-item notification.
///
/// Delivered at least once per item to every subscriber. Events from
/// different workers carry no relative ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    /// Handler succeeded for the item with this enqueue sequence number
    Processed { sequence: u64 },
    /// Handler failed or panicked; the pipeline keeps going
    Error { sequence: u64, message: String },
    /// Every worker has exited
    Completed { processed: u64, errors: u64 },
}

/// Snapshot of the processor counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStats {
    pub enqueued: u64,
    pub processed: u64,
    pub errors: u64,
    /// Enqueued but not yet handled
    pub pending: u64,
    pub elapsed_ms: u64,
    /// Handled items per second since start
    pub throughput: f64,
}

impl ProcessingStats {
    pub(crate) fn derive(enqueued: u64, processed: u64, errors: u64, elapsed_ms: u64) -> Self {
        let handled = processed + errors;
        let throughput = if elapsed_ms > 0 {
            handled as f64 * 1000.0 / elapsed_ms as f64
        } else {
            0.0
        };
        Self {
            enqueued,
            processed,
            errors,
            pending: enqueued.saturating_sub(handled),
            elapsed_ms,
            throughput,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_derivation() {
        let stats = ProcessingStats::derive(100, 60, 10, 2000);
        assert_eq!(stats.pending, 30);
        assert_eq!(stats.throughput, 35.0);

        let idle = ProcessingStats::derive(5, 0, 0, 0);
        assert_eq!(idle.pending, 5);
        assert_eq!(idle.throughput, 0.0);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ProcessorState::Idle,
            ProcessorState::Processing,
            ProcessorState::Draining,
            ProcessorState::Stopped,
        ] {
            assert_eq!(ProcessorState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&IngestEvent::Error { sequence: 3, message: "bad".into() }).unwrap();
        assert_eq!(json, r#"{"event":"error","sequence":3,"message":"bad"}"#);
    }
}
