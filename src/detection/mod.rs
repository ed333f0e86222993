// Parallel detection engine
//
// Credential extraction and threat detection over the fully loaded packet
// set. Small captures run sequentially; above the configured threshold the
// packets are split into fixed-size chunks processed on a bounded rayon
// pool, with findings pushed into lock-free queues and merged afterwards.

pub mod credentials;
pub mod threats;
pub mod types;

use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::SegQueue;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::cache::CapacityCache;
use crate::common::{CancelToken, MetricsCollector};
use crate::config::DetectionConfig;
use crate::error::{CapflowError, Result};
use crate::packet::PacketRecord;

pub use threats::{ScanAccumulator, ServiceResolver};
pub use types::{
    CredentialFinding, CredentialProtocol, DetectionReport, Severity, ThreatCategory,
    ThreatFinding, ThreatMetrics,
};

/// Packets between cancellation checks on the sequential path
const CANCEL_CHECK_INTERVAL: usize = 10_000;

pub struct DetectionEngine {
    config: DetectionConfig,
    services: ServiceResolver,
    metrics: Option<Arc<MetricsCollector>>,
}

impl DetectionEngine {
    pub fn new(config: DetectionConfig, services: ServiceResolver) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(CapflowError::config("detection chunk size must be greater than zero"));
        }
        Ok(Self { config, services, metrics: None })
    }

    /// Engine with its own service-name cache
    pub fn with_default_services(config: DetectionConfig, cache_capacity: usize) -> Result<Self> {
        let cache = CapacityCache::new(cache_capacity)?;
        Self::new(config, ServiceResolver::new(Arc::new(cache)))
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Run every detector over `packets`. Packets are only read.
    pub fn run(&self, packets: &[PacketRecord], cancel: &CancelToken) -> Result<DetectionReport> {
        let started = Instant::now();
        let parallel = packets.len() > self.config.parallel_threshold;

        let (credentials, threats, chunks) = if parallel {
            self.run_parallel(packets, cancel)?
        } else {
            let (c, t) = self.run_sequential(packets, cancel)?;
            (c, t, 1)
        };

        let report = self.finish(credentials, threats, parallel, chunks, started);
        if let Some(metrics) = &self.metrics {
            metrics.record_duration("detection", started.elapsed());
            metrics.increment("detection.credentials", report.credentials.len() as u64);
            metrics.increment("detection.threats", report.threats.len() as u64);
        }
        info!(
            packets = packets.len(),
            parallel,
            chunks,
            credentials = report.credentials.len(),
            threats = report.threats.len(),
            elapsed_ms = report.elapsed_ms,
            "Detection complete"
        );
        Ok(report)
    }

    fn run_sequential(
        &self,
        packets: &[PacketRecord],
        cancel: &CancelToken,
    ) -> Result<(Vec<CredentialFinding>, Vec<ThreatFinding>)> {
        debug!(packets = packets.len(), "Sequential detection");
        let mut credentials = Vec::new();
        let mut threats = Vec::new();
        let mut scans = ScanAccumulator::default();

        for (idx, packet) in packets.iter().enumerate() {
            if idx % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check()?;
            }
            if let Some(finding) = credentials::extract(packet) {
                credentials.push(finding);
            }
            threats::packet_threats(packet, &self.config, &mut threats);
            if let Some(finding) = threats::insecure_version(packet, &self.config.monitored_ports) {
                threats.push(finding);
            }
            scans.observe(packet);
        }

        threats.extend(scans.findings(self.config.port_scan_threshold));
        Ok((credentials, threats))
    }

    fn run_parallel(
        &self,
        packets: &[PacketRecord],
        cancel: &CancelToken,
    ) -> Result<(Vec<CredentialFinding>, Vec<ThreatFinding>, usize)> {
        let num_threads = self.config.actual_parallelism();
        let chunk_size = self.config.chunk_size;
        let chunks = packets.len().div_ceil(chunk_size);
        debug!(packets = packets.len(), chunk_size, chunks, num_threads, "Parallel detection");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("capflow-detect-{}", i))
            .build()
            .map_err(|e| CapflowError::config(format!("failed to build detection pool: {}", e)))?;

        let credential_queue: SegQueue<CredentialFinding> = SegQueue::new();
        let threat_queue: SegQueue<ThreatFinding> = SegQueue::new();
        let monitored = &self.config.monitored_ports;

        let scans = pool.install(|| -> Result<ScanAccumulator> {
            let scans = packets
                .par_chunks(chunk_size)
                .map(|chunk| -> Result<ScanAccumulator> {
                    cancel.check()?;
                    let mut scans = ScanAccumulator::default();
                    let mut local = Vec::new();
                    for packet in chunk {
                        if let Some(finding) = credentials::extract(packet) {
                            credential_queue.push(finding);
                        }
                        threats::packet_threats(packet, &self.config, &mut local);
                        scans.observe(packet);
                    }
                    local.into_iter().for_each(|f| threat_queue.push(f));
                    Ok(scans)
                })
                .try_reduce(ScanAccumulator::default, |a, b| Ok(a.merge(b)))?;

            // The version detector only applies to monitored ports
            cancel.check()?;
            let relevant: Vec<&PacketRecord> = packets
                .par_iter()
                .filter(|p| threats::is_monitored(p, monitored))
                .collect();
            debug!(relevant = relevant.len(), "Monitored-port subset for version detection");
            relevant.par_chunks(chunk_size).try_for_each(|chunk| -> Result<()> {
                cancel.check()?;
                for packet in chunk {
                    if let Some(finding) = threats::insecure_version(packet, monitored) {
                        threat_queue.push(finding);
                    }
                }
                Ok(())
            })?;

            Ok(scans)
        })?;

        let credentials: Vec<CredentialFinding> = std::iter::from_fn(|| credential_queue.pop()).collect();
        let mut threats: Vec<ThreatFinding> = std::iter::from_fn(|| threat_queue.pop()).collect();
        threats.extend(scans.findings(self.config.port_scan_threshold));
        Ok((credentials, threats, chunks))
    }

    /// Sort, assign missing risk scores, resolve service names, derive metrics
    fn finish(
        &self,
        mut credentials: Vec<CredentialFinding>,
        mut threats: Vec<ThreatFinding>,
        parallel: bool,
        chunks: usize,
        started: Instant,
    ) -> DetectionReport {
        credentials.sort_by(|a, b| (a.timestamp, a.frame).cmp(&(b.timestamp, b.frame)));
        threats.sort_by(|a, b| {
            (a.timestamp, a.frame, a.category, a.source).cmp(&(b.timestamp, b.frame, b.category, b.source))
        });

        for finding in threats.iter_mut() {
            finding.risk_score.get_or_insert(finding.severity.risk_score());
            if finding.service.is_none() {
                if let Some(port) = finding.port {
                    finding.service = Some(self.services.resolve(port).to_string());
                }
            }
        }

        let metrics = ThreatMetrics::from_findings(&threats);
        DetectionReport {
            credentials,
            threats,
            metrics,
            parallel,
            chunks,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{tcp_flags, CredentialRawFields, Transport};
    use chrono::{TimeZone, Utc};

    /// Mixed traffic: credentials, cleartext logins, a scan, TLS 1.0, jumbo frames
    fn traffic(n: u64) -> Vec<PacketRecord> {
        (1..=n)
            .map(|i| {
                let ts = Utc.timestamp_opt(1_700_000_000 + (i / 10) as i64, 0).unwrap();
                let base = PacketRecord::new(i, ts, "TCP", 60).with_transport(Transport::Tcp);
                match i % 9 {
                    0 => base
                        .with_endpoints("10.1.1.1".parse().unwrap(), Some(40000), "10.2.2.2".parse().unwrap(), Some(1 + (i % 400) as u16))
                        .with_tcp_flags(tcp_flags::SYN),
                    1 => base
                        .with_endpoints("10.1.1.2".parse().unwrap(), Some(40001), "10.2.2.2".parse().unwrap(), Some(21))
                        .with_tcp_flags(tcp_flags::PSH | tcp_flags::ACK)
                        .with_credentials(CredentialRawFields {
                            ftp_command: Some("USER".into()),
                            ftp_argument: Some(format!("user{}", i)),
                            ..Default::default()
                        }),
                    2 => base
                        .with_endpoints("10.1.1.3".parse().unwrap(), Some(40002), "10.2.2.3".parse().unwrap(), Some(23))
                        .with_tcp_flags(tcp_flags::SYN),
                    3 => base
                        .with_endpoints("10.1.1.4".parse().unwrap(), Some(40003), "10.2.2.4".parse().unwrap(), Some(443))
                        .with_tcp_flags(tcp_flags::ACK)
                        .with_info("Client Hello")
                        .with_metadata("tls.version", "0x0301"),
                    4 => {
                        let mut p = base.with_endpoints("10.1.1.5".parse().unwrap(), Some(40004), "10.2.2.5".parse().unwrap(), Some(8080));
                        p.length = 9100;
                        p
                    }
                    5 => base
                        .with_endpoints("10.1.1.6".parse().unwrap(), Some(161), "10.2.2.6".parse().unwrap(), Some(50000))
                        .with_transport(Transport::Udp)
                        .with_metadata("snmp.version", "0")
                        .with_credentials(CredentialRawFields {
                            snmp_community: Some("public".into()),
                            ..Default::default()
                        }),
                    _ => base.with_endpoints("10.1.1.7".parse().unwrap(), Some(40005), "10.2.2.7".parse().unwrap(), Some(80)),
                }
            })
            .collect()
    }

    fn engine(parallel_threshold: usize, chunk_size: usize) -> DetectionEngine {
        let config = DetectionConfig {
            parallel_threshold,
            chunk_size,
            max_parallelism: 4,
            ..DetectionConfig::default()
        };
        DetectionEngine::with_default_services(config, 64).unwrap()
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = DetectionConfig { chunk_size: 0, ..DetectionConfig::default() };
        assert!(DetectionEngine::with_default_services(config, 16).is_err());
    }

    #[test]
    fn test_sequential_and_parallel_paths_agree() {
        let packets = traffic(5_000);
        let cancel = CancelToken::new();

        let sequential = engine(usize::MAX, 100).run(&packets, &cancel).unwrap();
        let parallel = engine(0, 97).run(&packets, &cancel).unwrap();

        assert!(!sequential.parallel);
        assert!(parallel.parallel);
        assert_eq!(parallel.chunks, 52);

        assert_eq!(sequential.credentials, parallel.credentials);
        let seq: Vec<_> = sequential.threats.iter().map(|t| t.fingerprint()).collect();
        let par: Vec<_> = parallel.threats.iter().map(|t| t.fingerprint()).collect();
        assert_eq!(seq, par);
        assert_eq!(sequential.metrics, parallel.metrics);

        // every category shows up
        for category in [
            ThreatCategory::CleartextProtocol,
            ThreatCategory::InsecureVersion,
            ThreatCategory::PortScan,
            ThreatCategory::OversizedPacket,
        ] {
            assert!(sequential.threats.iter().any(|t| t.category == category), "{:?}", category);
        }
    }

    #[test]
    fn test_findings_sorted_and_scored() {
        let packets = traffic(900);
        let report = engine(0, 50).run(&packets, &CancelToken::new()).unwrap();

        assert!(report
            .credentials
            .windows(2)
            .all(|w| (w[0].timestamp, w[0].frame) <= (w[1].timestamp, w[1].frame)));
        assert!(report
            .threats
            .windows(2)
            .all(|w| (w[0].timestamp, w[0].frame) <= (w[1].timestamp, w[1].frame)));
        assert!(report.threats.iter().all(|t| t.risk_score.is_some()));
        assert_eq!(report.metrics.total, report.threats.len());

        let telnet = report
            .threats
            .iter()
            .find(|t| t.port == Some(23))
            .unwrap();
        assert_eq!(telnet.service.as_deref(), Some("telnet"));
        assert_eq!(telnet.risk_score, Some(7));
    }

    #[test]
    fn test_one_credential_per_packet() {
        let packets = traffic(90);
        let report = engine(usize::MAX, 10).run(&packets, &CancelToken::new()).unwrap();
        // 10 FTP USER packets + 10 SNMP community packets
        assert_eq!(report.credentials.len(), 20);
        let mut frames: Vec<u64> = report.credentials.iter().map(|c| c.frame).collect();
        frames.dedup();
        assert_eq!(frames.len(), 20);
    }

    #[test]
    fn test_cancellation() {
        let packets = traffic(1_000);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(engine(usize::MAX, 100).run(&packets, &cancel).unwrap_err().is_cancelled());
        assert!(engine(0, 100).run(&packets, &cancel).unwrap_err().is_cancelled());
    }

    #[test]
    fn test_metrics_recorded() {
        let metrics = Arc::new(MetricsCollector::noop());
        let engine = engine(usize::MAX, 10).with_metrics(Arc::clone(&metrics));
        let report = engine.run(&traffic(90), &CancelToken::new()).unwrap();
        assert_eq!(metrics.counter("detection.credentials"), report.credentials.len() as u64);
        assert!(metrics.snapshot().timings_ms.contains_key("detection"));
    }
}
