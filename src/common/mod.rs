// Common utilities shared across the pipeline components

pub mod binary;
pub mod cancel;
pub mod metrics;
pub mod progress;

// Re-exports for convenience
pub use binary::Endian;
pub use cancel::CancelToken;
pub use metrics::{MetricsCollector, MetricsSnapshot, NoopProbe, SysinfoProbe, SystemProbe};
pub use progress::{ProgressCallback, ProgressUpdate, Throttle};

/// Average Ethernet frame size used when no packet count is available
pub const AVERAGE_FRAME_SIZE: u64 = 1500;
