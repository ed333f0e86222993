//! Error types for the capture pipeline

use std::io;

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, CapflowError>;

/// Errors that can occur anywhere in the pipeline
#[derive(Error, Debug)]
pub enum CapflowError {
    /// Invalid capacity/size parameter, rejected at construction
    #[error("Configuration error: {0}")]
    Config(String),
    /// Out-of-bounds offset or length on a mapped file
    #[error("Range error: offset {offset} length {length} outside file of {size} bytes")]
    OutOfRange { offset: u64, length: u64, size: u64 },
    /// Missing file or unrecognized capture magic
    #[error("Not found: {0}")]
    NotFound(String),
    /// Invalid block length, missing byte-order magic, truncated header
    #[error("Corrupt capture: {0}")]
    Corrupt(String),
    /// Cooperative cancellation; never wrapped in another variant
    #[error("Operation cancelled")]
    Cancelled,
    /// `start` called on a processor that is already running
    #[error("Processor already started")]
    AlreadyStarted,
    /// Queue or file handle used after close
    #[error("Resource closed: {0}")]
    Closed(String),
    /// External decoder failure (process exit, malformed output)
    #[error("Decoder error: {0}")]
    Decoder(String),
    /// A pipeline stage aborted the run
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CapflowError {
    /// True when the error represents cancellation rather than failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CapflowError::Cancelled)
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        CapflowError::Config(msg.into())
    }

    pub(crate) fn stage(stage: &str, message: impl Into<String>) -> Self {
        CapflowError::Stage {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(CapflowError::Cancelled.is_cancelled());
        assert!(!CapflowError::config("bad").is_cancelled());
    }

    #[test]
    fn test_display() {
        let err = CapflowError::OutOfRange { offset: 10, length: 4, size: 12 };
        assert_eq!(
            err.to_string(),
            "Range error: offset 10 length 4 outside file of 12 bytes"
        );
        let err = CapflowError::stage("loading", "tshark exited with status 2");
        assert_eq!(err.to_string(), "Stage 'loading' failed: tshark exited with status 2");
    }
}
