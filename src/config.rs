//! Pipeline configuration
//!
//! Every section has serde defaults, so a config file only needs the keys
//! it wants to override.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::CacheOptions;
use crate::capture::InspectOptions;
use crate::error::{CapflowError, Result};
use crate::ingest::ProcessorOptions;

const CONFIG_DIR_NAME: &str = "capflow";
const CONFIG_FILE_NAME: &str = "config.json";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ingest: IngestConfig,
    pub detection: DetectionConfig,
    pub cache: CacheConfig,
    pub inspector: InspectorConfig,
    pub decoder: DecoderConfig,
}

/// Streaming ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// `None` (JSON `null`) for an unbounded queue
    pub queue_capacity: Option<usize>,
    /// 0 = CPU count
    pub worker_count: usize,
    /// Records between loading progress updates
    pub progress_interval: u64,
    pub dispose_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Some(10_000),
            worker_count: 0,
            progress_interval: 5_000,
            dispose_timeout_ms: 5_000,
        }
    }
}

impl IngestConfig {
    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions {
            queue_capacity: self.queue_capacity,
            worker_count: self.worker_count,
            dispose_timeout: Duration::from_millis(self.dispose_timeout_ms),
        }
    }
}

/// Detection engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Packet count above which detection runs chunked-parallel
    pub parallel_threshold: usize,
    /// Packets per parallel chunk
    pub chunk_size: usize,
    /// 0 = CPU count
    pub max_parallelism: usize,
    /// Ports the protocol-version detector looks at
    pub monitored_ports: Vec<u16>,
    /// Distinct destination ports from one source that count as a scan
    pub port_scan_threshold: usize,
    /// Frames larger than this are reported as oversized
    pub oversized_frame_bytes: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 500_000,
            chunk_size: 100_000,
            max_parallelism: 0,
            monitored_ports: vec![139, 161, 162, 443, 445, 465, 636, 853, 990, 993, 995, 5061, 8443],
            port_scan_threshold: 20,
            oversized_frame_bytes: 9_000,
        }
    }
}

impl DetectionConfig {
    pub fn actual_parallelism(&self) -> usize {
        if self.max_parallelism == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_parallelism
        }
    }
}

/// Capacity cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub geo_capacity: usize,
    pub service_capacity: usize,
    /// Entry lifetime; `None` disables expiry
    pub expiry_secs: Option<u64>,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            geo_capacity: 10_000,
            service_capacity: 1_024,
            expiry_secs: None,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    fn options(&self, capacity: usize) -> CacheOptions {
        let mut options = CacheOptions::new(capacity);
        if let Some(secs) = self.expiry_secs {
            options = options
                .with_expiry(Duration::from_secs(secs))
                .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs));
        }
        options
    }

    pub fn geo_options(&self) -> CacheOptions {
        self.options(self.geo_capacity)
    }

    pub fn service_options(&self) -> CacheOptions {
        self.options(self.service_capacity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    pub progress_interval_ms: u64,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self { progress_interval_ms: 200 }
    }
}

impl InspectorConfig {
    pub fn inspect_options(&self) -> InspectOptions {
        InspectOptions { progress_interval: Duration::from_millis(self.progress_interval_ms) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub tshark_path: PathBuf,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { tshark_path: PathBuf::from("tshark") }
    }
}

impl PipelineConfig {
    /// Default location: `<config dir>/capflow/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CapflowError::NotFound(format!("config file {}", path.display())));
        }
        let json = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&json)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when the
    /// file is missing or unusable
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            debug!("No config directory on this platform, using defaults");
            return Self::default();
        };
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring invalid config file");
                Self::default()
            }
        }
    }

    /// Write the config as pretty JSON, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.queue_capacity == Some(0) {
            return Err(CapflowError::config("ingest.queue_capacity must be greater than zero"));
        }
        if self.ingest.progress_interval == 0 {
            return Err(CapflowError::config("ingest.progress_interval must be greater than zero"));
        }
        if self.detection.chunk_size == 0 {
            return Err(CapflowError::config("detection.chunk_size must be greater than zero"));
        }
        if self.detection.port_scan_threshold == 0 {
            return Err(CapflowError::config("detection.port_scan_threshold must be greater than zero"));
        }
        if self.cache.geo_capacity == 0 || self.cache.service_capacity == 0 {
            return Err(CapflowError::config("cache capacities must be greater than zero"));
        }
        if self.cache.expiry_secs == Some(0) {
            return Err(CapflowError::config("cache.expiry_secs must be greater than zero"));
        }
        if self.cache.expiry_secs.is_some() && self.cache.sweep_interval_secs == 0 {
            return Err(CapflowError::config("cache.sweep_interval_secs must be greater than zero"));
        }
        Ok(())
    }
}
