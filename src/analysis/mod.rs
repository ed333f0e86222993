// Staged analysis pipeline
//
// Drives one capture through four ordered stages:
//   counting   -> packet count estimate (decoder count, else file size / 1500)
//   loading    -> decode into an ordered Vec, pre-warming geo lookups on a
//                 stream processor as new addresses appear
//   statistics -> traffic statistics, then credential/threat detection
//   finalizing -> summary figures and metrics snapshot
//
// Any stage failure aborts the run with a zero-valued report. Cancellation
// is checked between stages and per record while loading, and is reported
// as its own outcome.

pub mod stages;
pub mod statistics;
pub mod summary;

use std::cell::Cell;
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::CapacityCache;
use crate::capture::InspectProgress;
use crate::common::{
    CancelToken, MetricsCollector, MetricsSnapshot, ProgressCallback, ProgressUpdate, AVERAGE_FRAME_SIZE,
};
use crate::config::PipelineConfig;
use crate::decoder::PacketSource;
use crate::detection::{DetectionEngine, DetectionReport, ServiceResolver};
use crate::error::{CapflowError, Result};
use crate::ingest::{ProcessingStats, StreamProcessor};
use crate::packet::PacketRecord;

pub use stages::{AnalysisStage, StageStatus, StageTiming, StageTracker};
pub use statistics::{
    AddressScope, CachedGeoResolver, FlowKey, FlowStats, GeoInfo, GeoResolver, PrivateRangeResolver,
    TrafficStatistics,
};
pub use summary::CaptureSummary;

/// Length of the top-talker and top-port lists
const TOP_N: usize = 20;

/// Upper bound on up-front Vec reservation from a count estimate
const MAX_PREALLOCATED_PACKETS: u64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Everything one run produces
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisReport {
    pub path: PathBuf,
    /// Packet count estimate from the counting stage
    pub estimated_packets: u64,
    pub summary: CaptureSummary,
    pub statistics: TrafficStatistics,
    pub detection: DetectionReport,
    /// Geo pre-warm processor counters
    pub enrichment: ProcessingStats,
    pub stages: Vec<StageTiming>,
    pub metrics: MetricsSnapshot,
    pub elapsed_ms: u64,
}

/// Terminal event of a run
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub status: AnalysisStatus,
    pub report: AnalysisReport,
    /// Failure message when `status` is `Failed`
    pub error: Option<String>,
}

impl AnalysisOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == AnalysisStatus::Completed
    }
}

pub struct AnalysisPipeline {
    config: PipelineConfig,
    source: Arc<dyn PacketSource>,
    geo: Arc<CachedGeoResolver>,
    metrics: Arc<MetricsCollector>,
    progress: Option<ProgressCallback>,
}

impl AnalysisPipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn PacketSource>,
        geo: Arc<dyn GeoResolver>,
    ) -> Result<Self> {
        config.validate()?;
        let geo = Arc::new(CachedGeoResolver::new(geo, config.cache.geo_options())?);
        Ok(Self {
            config,
            source,
            geo,
            metrics: Arc::new(MetricsCollector::default()),
            progress: None,
        })
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn geo(&self) -> &CachedGeoResolver {
        &self.geo
    }

    /// Run every stage over the capture at `path`. Never returns an error:
    /// failure and cancellation are reported through the outcome.
    #[instrument(skip_all, fields(path = %path.display(), source = self.source.name()))]
    pub fn run(&self, path: &Path, cancel: &CancelToken) -> AnalysisOutcome {
        let started = Instant::now();
        let mut tracker = StageTracker::new();

        match self.execute(path, cancel, &mut tracker, started) {
            Ok(report) => {
                info!(
                    packets = report.summary.packet_count,
                    credentials = report.detection.credentials.len(),
                    threats = report.detection.threats.len(),
                    elapsed_ms = report.elapsed_ms,
                    "Analysis complete"
                );
                AnalysisOutcome { status: AnalysisStatus::Completed, report, error: None }
            }
            Err(e) if e.is_cancelled() => {
                info!("Analysis cancelled");
                self.aborted(AnalysisStatus::Cancelled, None, path, &tracker, started)
            }
            Err(e) => {
                error!(error = %e, "Analysis failed");
                self.aborted(AnalysisStatus::Failed, Some(e.to_string()), path, &tracker, started)
            }
        }
    }

    fn aborted(
        &self,
        status: AnalysisStatus,
        error: Option<String>,
        path: &Path,
        tracker: &StageTracker,
        started: Instant,
    ) -> AnalysisOutcome {
        let report = AnalysisReport {
            path: path.to_path_buf(),
            stages: tracker.timings(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            ..AnalysisReport::default()
        };
        AnalysisOutcome { status, report, error }
    }

    fn execute(
        &self,
        path: &Path,
        cancel: &CancelToken,
        tracker: &mut StageTracker,
        started: Instant,
    ) -> Result<AnalysisReport> {
        self.enter(tracker, AnalysisStage::Counting, cancel, started)?;
        let estimate = self.count(path, cancel, tracker, started)?;
        self.leave(tracker, AnalysisStage::Counting, estimate, started)?;

        self.enter(tracker, AnalysisStage::Loading, cancel, started)?;
        let (packets, enrichment) = self
            .load(path, estimate, cancel, tracker, started)
            .map_err(|e| stage_failure(AnalysisStage::Loading, e))?;
        self.leave(tracker, AnalysisStage::Loading, packets.len() as u64, started)?;

        self.enter(tracker, AnalysisStage::Statistics, cancel, started)?;
        let statistics = statistics::compute(&packets, &self.geo, TOP_N);
        tracker.set_percent(AnalysisStage::Statistics, 50.0);
        self.emit(tracker, AnalysisStage::Statistics, packets.len() as u64, packets.len() as u64, started);
        cancel.check()?;
        let detection = self
            .detect(&packets, cancel)
            .map_err(|e| stage_failure(AnalysisStage::Statistics, e))?;
        self.leave(tracker, AnalysisStage::Statistics, packets.len() as u64, started)?;

        self.enter(tracker, AnalysisStage::Finalizing, cancel, started)?;
        let summary = CaptureSummary::from_packets(&packets);
        if let Some(bytes) = self.metrics.sample_memory() {
            debug!(resident_bytes = bytes, "Memory after analysis");
        }
        self.leave(tracker, AnalysisStage::Finalizing, packets.len() as u64, started)?;

        Ok(AnalysisReport {
            path: path.to_path_buf(),
            estimated_packets: estimate,
            summary,
            statistics,
            detection,
            enrichment,
            stages: tracker.timings(),
            metrics: self.metrics.snapshot(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn enter(
        &self,
        tracker: &mut StageTracker,
        stage: AnalysisStage,
        cancel: &CancelToken,
        started: Instant,
    ) -> Result<()> {
        cancel.check()?;
        tracker.activate(stage)?;
        debug!(stage = stage.name(), "Stage started");
        self.emit(tracker, stage, 0, 0, started);
        Ok(())
    }

    fn leave(&self, tracker: &mut StageTracker, stage: AnalysisStage, processed: u64, started: Instant) -> Result<()> {
        tracker.complete(stage)?;
        let elapsed = tracker.elapsed(stage);
        self.metrics.record_duration(&format!("stage.{}", stage.name()), elapsed);
        debug!(stage = stage.name(), elapsed_ms = elapsed.as_millis() as u64, "Stage completed");
        self.emit(tracker, stage, processed, processed, started);
        Ok(())
    }

    fn emit(&self, tracker: &StageTracker, stage: AnalysisStage, processed: u64, total: u64, started: Instant) {
        if let Some(callback) = &self.progress {
            let update = ProgressUpdate::new(stage.name(), processed, total, started.elapsed())
                .with_percent(tracker.overall_percent());
            callback(&update);
        }
    }

    fn count(&self, path: &Path, cancel: &CancelToken, tracker: &mut StageTracker, started: Instant) -> Result<u64> {
        let (start, end) = AnalysisStage::Counting.progress_range();
        let walked = Cell::new(0.0f64);
        let report = |p: &InspectProgress| {
            walked.set(p.percent);
            if let Some(callback) = &self.progress {
                let overall = start + (end - start) * p.percent.clamp(0.0, 100.0) / 100.0;
                let update = ProgressUpdate::new(AnalysisStage::Counting.name(), p.packets, 0, started.elapsed())
                    .with_percent(overall);
                callback(&update);
            }
        };

        let counted = match self.source.count_packets(path, cancel, Some(&report as &dyn Fn(&InspectProgress))) {
            Ok(n) => n,
            Err(CapflowError::Cancelled) => return Err(CapflowError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Packet count unavailable");
                0
            }
        };
        tracker.set_percent(AnalysisStage::Counting, walked.get());
        if counted > 0 {
            debug!(packets = counted, "Counted packets");
            return Ok(counted);
        }
        let estimate = fs::metadata(path).map(|m| m.len() / AVERAGE_FRAME_SIZE).unwrap_or(0);
        debug!(estimate, "Estimated packet count from file size");
        Ok(estimate)
    }

    fn load(
        &self,
        path: &Path,
        estimate: u64,
        cancel: &CancelToken,
        tracker: &mut StageTracker,
        started: Instant,
    ) -> Result<(Vec<PacketRecord>, ProcessingStats)> {
        let mut packets: Vec<PacketRecord> = Vec::with_capacity(estimate.min(MAX_PREALLOCATED_PACKETS) as usize);

        let enrichment: StreamProcessor<IpAddr> = StreamProcessor::new(self.config.ingest.processor_options())?;
        let geo = Arc::clone(&self.geo);
        enrichment.start(
            move |ip| {
                geo.lookup(ip);
                Ok(())
            },
            None,
        )?;

        let interval = self.config.ingest.progress_interval;
        let mut seen: HashSet<IpAddr> = HashSet::new();
        let mut total_bytes = 0u64;

        for record in self.source.open(path, cancel)? {
            cancel.check()?;
            let packet = record?;
            total_bytes += u64::from(packet.length);
            for ip in [packet.source, packet.destination].into_iter().flatten() {
                if seen.insert(ip) {
                    enrichment.enqueue_with(ip, cancel)?;
                }
            }
            packets.push(packet);

            let loaded = packets.len() as u64;
            if loaded % interval == 0 {
                if estimate > 0 {
                    // the estimate can be low; hold short of 100 until done
                    let percent = (loaded as f64 * 100.0 / estimate as f64).min(99.0);
                    tracker.set_percent(AnalysisStage::Loading, percent);
                }
                self.emit(tracker, AnalysisStage::Loading, loaded, estimate, started);
            }
        }

        enrichment.complete_adding();
        enrichment.wait_for_completion()?;
        let stats = enrichment.stats();

        self.metrics.increment("packets.loaded", packets.len() as u64);
        self.metrics.increment("bytes.loaded", total_bytes);
        info!(
            packets = packets.len(),
            bytes = total_bytes,
            addresses = seen.len(),
            "Capture loaded"
        );
        Ok((packets, stats))
    }

    fn detect(&self, packets: &[PacketRecord], cancel: &CancelToken) -> Result<DetectionReport> {
        let services = CapacityCache::with_options(self.config.cache.service_options())?;
        let engine = DetectionEngine::new(self.config.detection.clone(), ServiceResolver::new(Arc::new(services)))?
            .with_metrics(Arc::clone(&self.metrics));
        engine.run(packets, cancel)
    }
}

/// Attach the stage name to a failure; cancellation passes through untouched
fn stage_failure(stage: AnalysisStage, e: CapflowError) -> CapflowError {
    match e {
        CapflowError::Cancelled | CapflowError::Stage { .. } => e,
        other => CapflowError::stage(stage.name(), other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::VecSource;
    use crate::packet::{tcp_flags, CredentialRawFields, Transport};
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn capture(n: u64) -> Vec<PacketRecord> {
        (1..=n)
            .map(|i| {
                let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap() + chrono::Duration::milliseconds(i as i64 * 10);
                let host = format!("10.0.0.{}", i % 5);
                let packet = PacketRecord::new(i, ts, if i % 2 == 0 { "HTTP" } else { "TCP" }, 100)
                    .with_endpoints(host.parse().unwrap(), Some(40000), "93.184.216.34".parse().unwrap(), Some(80))
                    .with_transport(Transport::Tcp)
                    .with_tcp_flags(tcp_flags::ACK);
                if i == 7 {
                    packet.with_credentials(CredentialRawFields {
                        http_authorization: Some("Basic YWxpY2U6c2VjcmV0".into()),
                        ..Default::default()
                    })
                } else {
                    packet
                }
            })
            .collect()
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.ingest.worker_count = 2;
        config.ingest.progress_interval = 10;
        config.ingest.queue_capacity = Some(4);
        config
    }

    fn pipeline(source: VecSource, config: PipelineConfig) -> AnalysisPipeline {
        AnalysisPipeline::new(config, Arc::new(source), Arc::new(PrivateRangeResolver))
            .unwrap()
            .with_metrics(Arc::new(MetricsCollector::noop()))
    }

    #[test]
    fn test_full_run() {
        let updates: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let pipeline = pipeline(VecSource::new(capture(100)), config())
            .with_progress(Arc::new(move |u: &ProgressUpdate| sink.lock().push(u.clone())));

        let outcome = pipeline.run(Path::new("memory.pcap"), &CancelToken::new());
        assert!(outcome.is_completed(), "{:?}", outcome.error);

        let report = &outcome.report;
        assert_eq!(report.estimated_packets, 100);
        assert_eq!(report.summary.packet_count, 100);
        assert_eq!(report.summary.total_bytes, 10_000);
        assert_eq!(report.summary.distinct_ips, 6);
        assert_eq!(report.statistics.total_packets, 100);
        assert_eq!(report.detection.credentials.len(), 1);
        assert_eq!(report.detection.credentials[0].username.as_deref(), Some("alice"));
        assert!(report.stages.iter().all(|s| s.status == StageStatus::Completed));

        // every distinct address was pre-warmed once, then hit in statistics
        assert_eq!(report.enrichment.processed, 6);
        let geo = pipeline.geo().cache_stats();
        assert_eq!(geo.misses, 6);
        assert!(geo.hits >= 6);

        let updates = updates.lock();
        assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(updates.last().map(|u| u.percent), Some(100.0));
        assert!(updates.iter().any(|u| u.phase == "loading" && u.processed == 50));

        assert_eq!(pipeline.metrics().counter("packets.loaded"), 100);
        assert!(report.metrics.timings_ms.contains_key("stage.loading"));
    }

    #[test]
    fn test_decoder_failure_yields_zero_valued_report() {
        let pipeline = pipeline(VecSource::new(capture(50)).failing_after(20), config());
        let outcome = pipeline.run(Path::new("memory.pcap"), &CancelToken::new());

        assert_eq!(outcome.status, AnalysisStatus::Failed);
        let message = outcome.error.unwrap();
        assert!(message.contains("loading"), "{}", message);
        assert_eq!(outcome.report.summary, CaptureSummary::default());
        assert!(outcome.report.detection.credentials.is_empty());
        assert_eq!(outcome.report.statistics.total_packets, 0);

        let stage = |s: AnalysisStage| outcome.report.stages.iter().find(|t| t.stage == s).unwrap().status;
        assert_eq!(stage(AnalysisStage::Counting), StageStatus::Completed);
        assert_eq!(stage(AnalysisStage::Loading), StageStatus::Active);
        assert_eq!(stage(AnalysisStage::Statistics), StageStatus::Pending);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = pipeline(VecSource::new(capture(10)), config()).run(Path::new("x"), &cancel);
        assert_eq!(outcome.status, AnalysisStatus::Cancelled);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_cancel_during_loading() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let pipeline = pipeline(VecSource::new(capture(500)), config()).with_progress(Arc::new(
            move |u: &ProgressUpdate| {
                if u.phase == "loading" && u.processed >= 100 {
                    trigger.cancel();
                }
            },
        ));

        let outcome = pipeline.run(Path::new("memory.pcap"), &cancel);
        assert_eq!(outcome.status, AnalysisStatus::Cancelled);
        assert_eq!(outcome.report.summary.packet_count, 0);
    }

    #[test]
    fn test_count_falls_back_to_file_size() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 15_000]).unwrap();
        file.flush().unwrap();

        let source = VecSource::new(capture(3)).with_reported_count(0);
        let outcome = pipeline(source, config()).run(file.path(), &CancelToken::new());
        assert!(outcome.is_completed());
        assert_eq!(outcome.report.estimated_packets, 10);
        assert_eq!(outcome.report.summary.packet_count, 3);
    }

    /// Reports header-walk progress in two steps, optionally cancelling first
    struct WalkingSource {
        inner: VecSource,
        cancel_while_counting: Option<CancelToken>,
    }

    impl PacketSource for WalkingSource {
        fn name(&self) -> &str {
            "walking"
        }

        fn count_packets(
            &self,
            _path: &Path,
            cancel: &CancelToken,
            progress: crate::decoder::CountProgress<'_>,
        ) -> Result<u64> {
            for packets in [5u64, 10] {
                if let Some(trigger) = &self.cancel_while_counting {
                    trigger.cancel();
                }
                cancel.check()?;
                if let Some(report) = progress {
                    report(&InspectProgress { percent: packets as f64 * 10.0, bytes_read: 0, packets, throughput: 0.0 });
                }
            }
            Ok(10)
        }

        fn open(&self, path: &Path, cancel: &CancelToken) -> Result<crate::decoder::PacketStream> {
            self.inner.open(path, cancel)
        }
    }

    #[test]
    fn test_counting_reports_progress() {
        let updates: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let source = WalkingSource { inner: VecSource::new(capture(10)), cancel_while_counting: None };
        let pipeline = AnalysisPipeline::new(config(), Arc::new(source), Arc::new(PrivateRangeResolver))
            .unwrap()
            .with_progress(Arc::new(move |u: &ProgressUpdate| sink.lock().push(u.clone())));

        let outcome = pipeline.run(Path::new("memory.pcap"), &CancelToken::new());
        assert!(outcome.is_completed(), "{:?}", outcome.error);
        assert_eq!(outcome.report.estimated_packets, 10);

        let updates = updates.lock();
        let counting: Vec<(u64, f64)> = updates
            .iter()
            .filter(|u| u.phase == "counting")
            .map(|u| (u.processed, u.percent))
            .collect();
        assert!(counting.contains(&(5, 5.0)));
        assert!(counting.contains(&(10, 10.0)));
        assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
    }

    #[test]
    fn test_cancel_during_counting() {
        let cancel = CancelToken::new();
        let source = WalkingSource { inner: VecSource::new(capture(10)), cancel_while_counting: Some(cancel.clone()) };
        let pipeline = AnalysisPipeline::new(config(), Arc::new(source), Arc::new(PrivateRangeResolver)).unwrap();

        let outcome = pipeline.run(Path::new("memory.pcap"), &cancel);
        assert_eq!(outcome.status, AnalysisStatus::Cancelled);
        assert!(outcome.error.is_none());
        let counting = outcome.report.stages.iter().find(|t| t.stage == AnalysisStage::Counting).unwrap();
        assert_eq!(counting.status, StageStatus::Active);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.detection.chunk_size = 0;
        assert!(AnalysisPipeline::new(config, Arc::new(VecSource::default()), Arc::new(PrivateRangeResolver)).is_err());
    }
}
