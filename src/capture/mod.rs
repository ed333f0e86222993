//! Capture-format inspection
//!
//! A fast header walk over classic and next-generation capture files that
//! yields a packet count without running the external decoder.

pub mod inspector;
pub mod types;

pub use inspector::{inspect, inspect_reader, inspect_with, InspectOptions};
pub use types::{
    detect_format, CaptureFormat, InspectProgress, InspectionResult, TimestampResolution,
};
