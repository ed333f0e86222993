//! Aggregate traffic statistics and geo enrichment
//!
//! Statistics are folded per rayon split and reduced, so the result does
//! not depend on how the packets were partitioned. Geo lookups go through
//! a capacity cache because the same handful of addresses repeat across
//! millions of packets.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::cache::{CacheOptions, CacheStats, CapacityCache};
use crate::error::Result;
use crate::packet::{PacketRecord, Transport};

// =============================================================================
// Geo enrichment
// =============================================================================

/// Coarse classification of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressScope {
    Private,
    Loopback,
    LinkLocal,
    Multicast,
    Unspecified,
    Public,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoInfo {
    pub ip: IpAddr,
    pub scope: AddressScope,
    pub country: Option<String>,
    pub organization: Option<String>,
}

/// Source of geographic/organizational metadata for an address
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> GeoInfo;
}

/// Resolver that only classifies address ranges
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateRangeResolver;

impl PrivateRangeResolver {
    pub fn scope(ip: IpAddr) -> AddressScope {
        match ip {
            IpAddr::V4(v4) => {
                if v4.is_unspecified() {
                    AddressScope::Unspecified
                } else if v4.is_loopback() {
                    AddressScope::Loopback
                } else if v4.is_private() {
                    AddressScope::Private
                } else if v4.is_link_local() {
                    AddressScope::LinkLocal
                } else if v4.is_multicast() || v4.is_broadcast() {
                    AddressScope::Multicast
                } else {
                    AddressScope::Public
                }
            }
            IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                if v6.is_unspecified() {
                    AddressScope::Unspecified
                } else if v6.is_loopback() {
                    AddressScope::Loopback
                } else if v6.is_multicast() {
                    AddressScope::Multicast
                } else if first & 0xffc0 == 0xfe80 {
                    AddressScope::LinkLocal
                } else if first & 0xfe00 == 0xfc00 {
                    // unique local fc00::/7
                    AddressScope::Private
                } else if let Some(v4) = v6.to_ipv4_mapped() {
                    Self::scope(IpAddr::V4(v4))
                } else {
                    AddressScope::Public
                }
            }
        }
    }
}

impl GeoResolver for PrivateRangeResolver {
    fn resolve(&self, ip: IpAddr) -> GeoInfo {
        let scope = Self::scope(ip);
        GeoInfo {
            ip,
            scope,
            country: None,
            organization: (scope != AddressScope::Public).then(|| "internal".to_string()),
        }
    }
}

/// A [`GeoResolver`] memoized in a capacity cache
pub struct CachedGeoResolver {
    inner: Arc<dyn GeoResolver>,
    cache: CapacityCache<IpAddr, Arc<GeoInfo>>,
}

impl CachedGeoResolver {
    pub fn new(inner: Arc<dyn GeoResolver>, options: CacheOptions) -> Result<Self> {
        Ok(Self { inner, cache: CapacityCache::with_options(options)? })
    }

    pub fn lookup(&self, ip: IpAddr) -> Arc<GeoInfo> {
        self.cache.get_or_compute(ip, || Arc::new(self.inner.resolve(ip)))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Flow identity (5-tuple)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowKey {
    pub source: Option<IpAddr>,
    pub destination: Option<IpAddr>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub transport: Transport,
}

impl FlowKey {
    fn of(packet: &PacketRecord) -> Self {
        Self {
            source: packet.source,
            destination: packet.destination,
            source_port: packet.source_port,
            destination_port: packet.destination_port,
            transport: packet.transport,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowStats {
    #[serde(flatten)]
    pub key: FlowKey,
    pub packets: u64,
    pub bytes: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolShare {
    pub protocol: String,
    pub packets: u64,
    pub bytes: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TalkerStats {
    pub ip: IpAddr,
    pub packets: u64,
    /// Bytes sent plus received
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortCount {
    pub port: u16,
    pub packets: u64,
}

/// Aggregate statistics over a loaded capture
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrafficStatistics {
    pub total_packets: u64,
    pub total_bytes: u64,
    /// Sorted by packet count, descending
    pub protocols: Vec<ProtocolShare>,
    pub top_talkers: Vec<TalkerStats>,
    pub top_ports: Vec<PortCount>,
    /// Every flow, largest first
    pub flows: Vec<FlowStats>,
    /// One entry per distinct address, sorted by address
    pub geo: Vec<GeoInfo>,
}

/// Per-split accumulator
#[derive(Default)]
struct Partial {
    packets: u64,
    bytes: u64,
    protocols: HashMap<String, (u64, u64)>,
    talkers: HashMap<IpAddr, (u64, u64)>,
    ports: HashMap<u16, u64>,
    flows: HashMap<FlowKey, FlowStats>,
}

impl Partial {
    fn add(mut self, packet: &PacketRecord) -> Self {
        let bytes = u64::from(packet.length);
        self.packets += 1;
        self.bytes += bytes;

        let proto = self.protocols.entry(packet.protocol.clone()).or_default();
        proto.0 += 1;
        proto.1 += bytes;

        for ip in [packet.source, packet.destination].into_iter().flatten() {
            let talker = self.talkers.entry(ip).or_default();
            talker.0 += 1;
            talker.1 += bytes;
        }
        if let Some(port) = packet.destination_port {
            *self.ports.entry(port).or_default() += 1;
        }

        let key = FlowKey::of(packet);
        self.flows
            .entry(key)
            .and_modify(|flow| {
                flow.packets += 1;
                flow.bytes += bytes;
                flow.first_seen = flow.first_seen.min(packet.timestamp);
                flow.last_seen = flow.last_seen.max(packet.timestamp);
            })
            .or_insert(FlowStats {
                key,
                packets: 1,
                bytes,
                first_seen: packet.timestamp,
                last_seen: packet.timestamp,
            });
        self
    }

    fn merge(mut self, other: Partial) -> Self {
        self.packets += other.packets;
        self.bytes += other.bytes;
        for (name, (p, b)) in other.protocols {
            let entry = self.protocols.entry(name).or_default();
            entry.0 += p;
            entry.1 += b;
        }
        for (ip, (p, b)) in other.talkers {
            let entry = self.talkers.entry(ip).or_default();
            entry.0 += p;
            entry.1 += b;
        }
        for (port, n) in other.ports {
            *self.ports.entry(port).or_default() += n;
        }
        for (key, theirs) in other.flows {
            match self.flows.get_mut(&key) {
                Some(ours) => {
                    ours.packets += theirs.packets;
                    ours.bytes += theirs.bytes;
                    ours.first_seen = ours.first_seen.min(theirs.first_seen);
                    ours.last_seen = ours.last_seen.max(theirs.last_seen);
                }
                None => {
                    self.flows.insert(key, theirs);
                }
            }
        }
        self
    }
}

/// Compute statistics over the loaded packets. `top_n` bounds the talker
/// and port lists.
pub fn compute(packets: &[PacketRecord], geo: &CachedGeoResolver, top_n: usize) -> TrafficStatistics {
    let partial = packets
        .par_iter()
        .fold(Partial::default, Partial::add)
        .reduce(Partial::default, Partial::merge);

    let mut protocols: Vec<ProtocolShare> = partial
        .protocols
        .into_iter()
        .map(|(protocol, (packets, bytes))| ProtocolShare {
            protocol,
            packets,
            bytes,
            percent: if partial.packets > 0 {
                packets as f64 * 100.0 / partial.packets as f64
            } else {
                0.0
            },
        })
        .collect();
    protocols.sort_by(|a, b| b.packets.cmp(&a.packets).then_with(|| a.protocol.cmp(&b.protocol)));

    let mut addresses: Vec<IpAddr> = partial.talkers.keys().copied().collect();
    addresses.sort();
    let geo_info = addresses.par_iter().map(|ip| (*geo.lookup(*ip)).clone()).collect();

    let mut top_talkers: Vec<TalkerStats> = partial
        .talkers
        .into_iter()
        .map(|(ip, (packets, bytes))| TalkerStats { ip, packets, bytes })
        .collect();
    top_talkers.sort_by_key(|t| (Reverse(t.bytes), t.ip));
    top_talkers.truncate(top_n);

    let mut top_ports: Vec<PortCount> = partial
        .ports
        .into_iter()
        .map(|(port, packets)| PortCount { port, packets })
        .collect();
    top_ports.sort_by_key(|p| (Reverse(p.packets), p.port));
    top_ports.truncate(top_n);

    let mut flows: Vec<FlowStats> = partial.flows.into_values().collect();
    flows.sort_by_key(|f| (Reverse(f.bytes), f.key));

    TrafficStatistics {
        total_packets: partial.packets,
        total_bytes: partial.bytes,
        protocols,
        top_talkers,
        top_ports,
        flows,
        geo: geo_info,
    }
}

/// Distinct addresses in first-seen order
pub fn distinct_addresses(packets: &[PacketRecord]) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    packets
        .iter()
        .flat_map(|p| [p.source, p.destination])
        .flatten()
        .filter(|ip| seen.insert(*ip))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn packet(n: u64, src: &str, dst: &str, dport: u16, proto: &str, len: u32) -> PacketRecord {
        PacketRecord::new(n, Utc.timestamp_opt(1_700_000_000 + n as i64, 0).unwrap(), proto, len)
            .with_endpoints(src.parse().unwrap(), Some(50000), dst.parse().unwrap(), Some(dport))
            .with_transport(Transport::Tcp)
    }

    fn resolver() -> CachedGeoResolver {
        CachedGeoResolver::new(Arc::new(PrivateRangeResolver), CacheOptions::new(64)).unwrap()
    }

    #[test]
    fn test_address_scopes() {
        let scope = |s: &str| PrivateRangeResolver::scope(s.parse().unwrap());
        assert_eq!(scope("10.1.2.3"), AddressScope::Private);
        assert_eq!(scope("192.168.0.1"), AddressScope::Private);
        assert_eq!(scope("127.0.0.1"), AddressScope::Loopback);
        assert_eq!(scope("169.254.1.1"), AddressScope::LinkLocal);
        assert_eq!(scope("224.0.0.251"), AddressScope::Multicast);
        assert_eq!(scope("8.8.8.8"), AddressScope::Public);
        assert_eq!(scope("fe80::1"), AddressScope::LinkLocal);
        assert_eq!(scope("fd00::1"), AddressScope::Private);
        assert_eq!(scope("::ffff:10.0.0.1"), AddressScope::Private);
        assert_eq!(scope("2001:4860::8888"), AddressScope::Public);
    }

    #[test]
    fn test_compute_aggregates() {
        let packets = vec![
            packet(1, "10.0.0.1", "8.8.8.8", 443, "TLS", 100),
            packet(2, "10.0.0.1", "8.8.8.8", 443, "TLS", 200),
            packet(3, "10.0.0.2", "1.1.1.1", 53, "DNS", 80),
            packet(4, "10.0.0.1", "8.8.8.8", 443, "TLS", 300),
        ];
        let stats = compute(&packets, &resolver(), 10);

        assert_eq!(stats.total_packets, 4);
        assert_eq!(stats.total_bytes, 680);
        assert_eq!(stats.protocols[0].protocol, "TLS");
        assert_eq!(stats.protocols[0].packets, 3);
        assert_eq!(stats.protocols[0].percent, 75.0);

        assert_eq!(stats.top_talkers[0].bytes, 600);
        assert_eq!(stats.top_ports[0], PortCount { port: 443, packets: 3 });

        assert_eq!(stats.flows.len(), 2);
        let tls = &stats.flows[0];
        assert_eq!(tls.packets, 3);
        assert_eq!(tls.bytes, 600);
        assert_eq!(tls.first_seen, packets[0].timestamp);
        assert_eq!(tls.last_seen, packets[3].timestamp);

        assert_eq!(stats.geo.len(), 4);
        assert!(stats.geo.iter().any(|g| g.ip == "8.8.8.8".parse::<IpAddr>().unwrap() && g.scope == AddressScope::Public));
    }

    #[test]
    fn test_top_n_truncates() {
        let packets: Vec<PacketRecord> = (1..=20)
            .map(|i| packet(i, "10.0.0.1", "10.0.0.2", 1000 + i as u16, "TCP", 60))
            .collect();
        let stats = compute(&packets, &resolver(), 5);
        assert_eq!(stats.top_ports.len(), 5);
        // ties broken by port number
        assert_eq!(stats.top_ports[0].port, 1001);
    }

    #[test]
    fn test_geo_lookups_are_memoized() {
        let geo = resolver();
        let packets = vec![packet(1, "10.0.0.1", "8.8.8.8", 443, "TLS", 100)];
        compute(&packets, &geo, 10);
        compute(&packets, &geo, 10);
        let stats = geo.cache_stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn test_distinct_addresses_first_seen_order() {
        let packets = vec![
            packet(1, "10.0.0.2", "10.0.0.1", 80, "HTTP", 60),
            packet(2, "10.0.0.1", "10.0.0.3", 80, "HTTP", 60),
        ];
        let ips: Vec<String> = distinct_addresses(&packets).iter().map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn test_empty_input() {
        let stats = compute(&[], &resolver(), 10);
        assert_eq!(stats.total_packets, 0);
        assert!(stats.protocols.is_empty());
        assert!(stats.flows.is_empty());
    }
}
