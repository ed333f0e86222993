//! Threat and anomaly detectors
//!
//! Per-packet detectors are pure functions of one record. Port-scan
//! detection needs the whole capture, so each chunk builds a
//! [`ScanAccumulator`] and the partial maps are merged before findings are
//! emitted. Merging is a union with first-seen minimums, which makes the
//! result independent of how the packets were chunked.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::types::{Severity, ThreatCategory, ThreatFinding};
use crate::cache::CapacityCache;
use crate::config::DetectionConfig;
use crate::packet::{PacketRecord, Transport};

/// Cleartext login protocols, flagged on connection attempts
const CLEARTEXT_SERVICES: &[(u16, Severity)] = &[
    (21, Severity::Medium),
    (23, Severity::High),
    (110, Severity::Medium),
    (143, Severity::Medium),
    (512, Severity::High),
    (513, Severity::High),
    (514, Severity::High),
];

/// Ports associated with well-known backdoors and C2 defaults
const BACKDOOR_PORTS: &[(u16, &str, Severity)] = &[
    (1337, "common backdoor", Severity::Medium),
    (4444, "Metasploit default listener", Severity::High),
    (5554, "Sasser worm FTP", Severity::High),
    (6667, "IRC (common botnet C2)", Severity::Medium),
    (12345, "NetBus", Severity::High),
    (27374, "SubSeven", Severity::High),
    (31337, "Back Orifice", Severity::Critical),
];

/// Port scans touching at least this many ports carry a fixed score
const WIDE_SCAN_PORTS: usize = 100;
const WIDE_SCAN_RISK: u8 = 8;

/// Well-known service name for a port
pub fn well_known_service(port: u16) -> &'static str {
    match port {
        20 | 21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "dns",
        67 | 68 => "dhcp",
        69 => "tftp",
        80 | 8080 => "http",
        88 => "kerberos",
        110 => "pop3",
        123 => "ntp",
        135 => "msrpc",
        137..=139 => "netbios",
        143 => "imap",
        161 | 162 => "snmp",
        389 => "ldap",
        443 | 8443 => "https",
        445 => "smb",
        465 | 587 => "smtps",
        512 => "rexec",
        513 => "rlogin",
        514 => "rsh",
        636 => "ldaps",
        853 => "dns-over-tls",
        990 => "ftps",
        993 => "imaps",
        995 => "pop3s",
        1433 => "mssql",
        3306 => "mysql",
        3389 => "rdp",
        5060 | 5061 => "sip",
        5432 => "postgresql",
        6667 => "irc",
        _ => "unknown",
    }
}

/// Port to service-name resolution memoized in a capacity cache
#[derive(Clone)]
pub struct ServiceResolver {
    cache: Arc<CapacityCache<u16, Arc<str>>>,
}

impl ServiceResolver {
    pub fn new(cache: Arc<CapacityCache<u16, Arc<str>>>) -> Self {
        Self { cache }
    }

    pub fn resolve(&self, port: u16) -> Arc<str> {
        self.cache.get_or_compute(port, || Arc::from(well_known_service(port)))
    }

    pub fn cache(&self) -> &CapacityCache<u16, Arc<str>> {
        &self.cache
    }
}

/// Detectors that look at one packet at a time, excluding the
/// monitored-port version check
pub fn packet_threats(packet: &PacketRecord, config: &DetectionConfig, out: &mut Vec<ThreatFinding>) {
    if let Some(f) = cleartext_protocol(packet) {
        out.push(f);
    }
    if let Some(f) = backdoor_port(packet) {
        out.push(f);
    }
    if let Some(f) = oversized_packet(packet, config.oversized_frame_bytes) {
        out.push(f);
    }
}

fn cleartext_protocol(packet: &PacketRecord) -> Option<ThreatFinding> {
    if !packet.is_syn_only() {
        return None;
    }
    let port = packet.destination_port?;
    let (_, severity) = CLEARTEXT_SERVICES.iter().find(|(p, _)| *p == port)?;
    Some(ThreatFinding::from_packet(
        packet,
        ThreatCategory::CleartextProtocol,
        *severity,
        format!("Connection to cleartext {} service on port {}", well_known_service(port), port),
    ))
}

fn backdoor_port(packet: &PacketRecord) -> Option<ThreatFinding> {
    let initiating = packet.is_syn_only() || packet.transport == Transport::Udp;
    if !initiating {
        return None;
    }
    let port = packet.destination_port?;
    let (_, label, severity) = BACKDOOR_PORTS.iter().find(|(p, _, _)| *p == port)?;
    Some(ThreatFinding::from_packet(
        packet,
        ThreatCategory::BackdoorPort,
        *severity,
        format!("Traffic to port {} ({})", port, label),
    ))
}

fn oversized_packet(packet: &PacketRecord, limit: u32) -> Option<ThreatFinding> {
    if packet.length <= limit {
        return None;
    }
    Some(ThreatFinding::from_packet(
        packet,
        ThreatCategory::OversizedPacket,
        Severity::Low,
        format!("Frame of {} bytes exceeds {} byte limit", packet.length, limit),
    ))
}

/// True when either endpoint port is monitored
pub fn is_monitored(packet: &PacketRecord, monitored: &[u16]) -> bool {
    [packet.source_port, packet.destination_port]
        .iter()
        .flatten()
        .any(|port| monitored.contains(port))
}

/// Insecure protocol versions on monitored ports
pub fn insecure_version(packet: &PacketRecord, monitored: &[u16]) -> Option<ThreatFinding> {
    if !is_monitored(packet, monitored) {
        return None;
    }

    if let Some(version) = packet.meta("tls.version") {
        if packet.info.contains("Hello") {
            let (name, severity) = match version {
                "0x0300" => ("SSLv3", Severity::High),
                "0x0301" => ("TLS 1.0", Severity::Medium),
                "0x0302" => ("TLS 1.1", Severity::Low),
                _ => return None,
            };
            return Some(ThreatFinding::from_packet(
                packet,
                ThreatCategory::InsecureVersion,
                severity,
                format!("{} handshake", name),
            ));
        }
    }

    if packet.meta("smb.version") == Some("1") {
        return Some(ThreatFinding::from_packet(
            packet,
            ThreatCategory::InsecureVersion,
            Severity::High,
            "SMBv1 in use".to_string(),
        ));
    }

    if packet.meta("snmp.version") == Some("0") {
        return Some(ThreatFinding::from_packet(
            packet,
            ThreatCategory::InsecureVersion,
            Severity::Medium,
            "SNMPv1 in use".to_string(),
        ));
    }

    None
}

#[derive(Debug, Clone)]
struct ScanState {
    ports: BTreeSet<u16>,
    targets: BTreeSet<IpAddr>,
    first_frame: u64,
    first_seen: DateTime<Utc>,
    first_destination: Option<IpAddr>,
}

/// Partial port-scan state for one chunk (or a merge of several)
#[derive(Debug, Clone, Default)]
pub struct ScanAccumulator {
    sources: HashMap<IpAddr, ScanState>,
}

impl ScanAccumulator {
    /// Record a connection attempt (TCP SYN without ACK)
    pub fn observe(&mut self, packet: &PacketRecord) {
        if !packet.is_syn_only() {
            return;
        }
        let (Some(source), Some(port)) = (packet.source, packet.destination_port) else {
            return;
        };
        let state = self.sources.entry(source).or_insert_with(|| ScanState {
            ports: BTreeSet::new(),
            targets: BTreeSet::new(),
            first_frame: packet.number,
            first_seen: packet.timestamp,
            first_destination: packet.destination,
        });
        state.ports.insert(port);
        if let Some(dst) = packet.destination {
            state.targets.insert(dst);
        }
        if packet.number < state.first_frame {
            state.first_frame = packet.number;
            state.first_seen = packet.timestamp;
            state.first_destination = packet.destination;
        }
    }

    pub fn merge(mut self, other: ScanAccumulator) -> ScanAccumulator {
        for (source, theirs) in other.sources {
            match self.sources.get_mut(&source) {
                Some(ours) => {
                    ours.ports.extend(theirs.ports);
                    ours.targets.extend(theirs.targets);
                    if theirs.first_frame < ours.first_frame {
                        ours.first_frame = theirs.first_frame;
                        ours.first_seen = theirs.first_seen;
                        ours.first_destination = theirs.first_destination;
                    }
                }
                None => {
                    self.sources.insert(source, theirs);
                }
            }
        }
        self
    }

    /// Emit one finding per source at or above `threshold` distinct ports
    pub fn findings(&self, threshold: usize) -> Vec<ThreatFinding> {
        let mut out = Vec::new();
        for (source, state) in &self.sources {
            let ports = state.ports.len();
            if ports < threshold {
                continue;
            }
            let severity = if ports >= WIDE_SCAN_PORTS { Severity::High } else { Severity::Medium };
            out.push(ThreatFinding {
                id: uuid::Uuid::new_v4(),
                category: ThreatCategory::PortScan,
                severity,
                risk_score: (ports >= WIDE_SCAN_PORTS).then_some(WIDE_SCAN_RISK),
                frame: state.first_frame,
                timestamp: state.first_seen,
                source: Some(*source),
                destination: state.first_destination,
                port: None,
                service: None,
                description: format!(
                    "{} probed {} distinct ports on {} host(s)",
                    source,
                    ports,
                    state.targets.len()
                ),
            });
        }
        out
    }
}
