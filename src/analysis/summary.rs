//! Capture summary figures derived in the finalizing stage

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::packet::PacketRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureSummary {
    pub packet_count: u64,
    pub total_bytes: u64,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub average_packet_size: f64,
    pub distinct_protocols: usize,
    pub distinct_ips: usize,
    pub distinct_ports: usize,
}

impl CaptureSummary {
    pub fn from_packets(packets: &[PacketRecord]) -> Self {
        if packets.is_empty() {
            return Self::default();
        }

        let mut protocols = HashSet::new();
        let mut ips = HashSet::new();
        let mut ports = HashSet::new();
        let mut total_bytes = 0u64;
        let mut first = packets[0].timestamp;
        let mut last = packets[0].timestamp;

        for packet in packets {
            total_bytes += u64::from(packet.length);
            first = first.min(packet.timestamp);
            last = last.max(packet.timestamp);
            protocols.insert(packet.protocol.as_str());
            ips.extend([packet.source, packet.destination].into_iter().flatten());
            ports.extend([packet.source_port, packet.destination_port].into_iter().flatten());
        }

        let duration_ms = (last - first).num_milliseconds().max(0) as u64;
        Self {
            packet_count: packets.len() as u64,
            total_bytes,
            first_timestamp: Some(first),
            last_timestamp: Some(last),
            duration_ms,
            average_packet_size: total_bytes as f64 / packets.len() as f64,
            distinct_protocols: protocols.len(),
            distinct_ips: ips.len(),
            distinct_ports: ports.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_summary_figures() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let packets = vec![
            PacketRecord::new(1, t0, "DNS", 100).with_endpoints(
                "10.0.0.1".parse().unwrap(),
                Some(5353),
                "10.0.0.2".parse().unwrap(),
                Some(53),
            ),
            PacketRecord::new(2, t0 + chrono::Duration::milliseconds(2500), "TLS", 300).with_endpoints(
                "10.0.0.1".parse().unwrap(),
                Some(40000),
                "10.0.0.3".parse().unwrap(),
                Some(443),
            ),
        ];

        let summary = CaptureSummary::from_packets(&packets);
        assert_eq!(summary.packet_count, 2);
        assert_eq!(summary.total_bytes, 400);
        assert_eq!(summary.duration_ms, 2500);
        assert_eq!(summary.average_packet_size, 200.0);
        assert_eq!(summary.distinct_protocols, 2);
        assert_eq!(summary.distinct_ips, 3);
        assert_eq!(summary.distinct_ports, 4);
    }

    #[test]
    fn test_empty_is_zero_valued() {
        assert_eq!(CaptureSummary::from_packets(&[]), CaptureSummary::default());
    }
}
