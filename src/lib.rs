//! capflow: bounded-memory ingestion and analysis of network captures
//!
//! A capture flows through an [`analysis::AnalysisPipeline`]: the packet
//! count is estimated (by the decoder or the [`capture`] header walker),
//! records are decoded by a [`decoder::PacketSource`] into an ordered
//! collection, then statistics and the parallel [`detection`] engine run
//! over the loaded set. The performance primitives the pipeline is built on
//! ([`cache`], [`pool`], [`mapped`], [`ingest`]) are usable on their own.

pub mod analysis;
pub mod cache;
pub mod capture;
pub mod common;
pub mod config;
pub mod decoder;
pub mod detection;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod mapped;
pub mod packet;
pub mod pool;

pub use analysis::{AnalysisOutcome, AnalysisPipeline, AnalysisReport, AnalysisStatus};
pub use cache::CapacityCache;
pub use common::CancelToken;
pub use config::PipelineConfig;
pub use error::{CapflowError, Result};
pub use ingest::StreamProcessor;
pub use mapped::MappedCaptureFile;
pub use packet::PacketRecord;
pub use pool::{ByteBufferPool, ObjectPool};
