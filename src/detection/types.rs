//! Detection findings and summary metrics

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::packet::PacketRecord;

// =============================================================================
// Credentials
// =============================================================================

/// Protocol a credential was exposed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CredentialProtocol {
    #[serde(rename = "HTTP-Basic")]
    HttpBasic,
    #[serde(rename = "HTTP-Digest")]
    HttpDigest,
    #[serde(rename = "FTP")]
    Ftp,
    #[serde(rename = "SMTP")]
    Smtp,
    #[serde(rename = "IMAP")]
    Imap,
    #[serde(rename = "POP3")]
    Pop3,
    #[serde(rename = "LDAP")]
    Ldap,
    #[serde(rename = "SNMP")]
    Snmp,
    Kerberos,
    #[serde(rename = "NTLM")]
    Ntlm,
    #[serde(rename = "MySQL")]
    MySql,
    #[serde(rename = "PostgreSQL")]
    PostgreSql,
}

impl CredentialProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialProtocol::HttpBasic => "HTTP-Basic",
            CredentialProtocol::HttpDigest => "HTTP-Digest",
            CredentialProtocol::Ftp => "FTP",
            CredentialProtocol::Smtp => "SMTP",
            CredentialProtocol::Imap => "IMAP",
            CredentialProtocol::Pop3 => "POP3",
            CredentialProtocol::Ldap => "LDAP",
            CredentialProtocol::Snmp => "SNMP",
            CredentialProtocol::Kerberos => "Kerberos",
            CredentialProtocol::Ntlm => "NTLM",
            CredentialProtocol::MySql => "MySQL",
            CredentialProtocol::PostgreSql => "PostgreSQL",
        }
    }
}

impl fmt::Display for CredentialProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One credential exposure. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialFinding {
    pub frame: u64,
    pub timestamp: DateTime<Utc>,
    pub source: Option<IpAddr>,
    pub destination: Option<IpAddr>,
    pub destination_port: Option<u16>,
    pub protocol: CredentialProtocol,
    pub username: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    pub context: Option<String>,
}

impl CredentialFinding {
    pub(crate) fn from_packet(packet: &PacketRecord, protocol: CredentialProtocol) -> Self {
        Self {
            frame: packet.number,
            timestamp: packet.timestamp,
            source: packet.source,
            destination: packet.destination,
            destination_port: packet.destination_port,
            protocol,
            username: None,
            password: None,
            domain: None,
            context: None,
        }
    }

    pub(crate) fn user(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub(crate) fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub(crate) fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

// =============================================================================
// Threats
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Fixed severity to risk-score mapping
    pub fn risk_score(&self) -> u8 {
        match self {
            Severity::Critical => 9,
            Severity::High => 7,
            Severity::Medium => 5,
            Severity::Low => 3,
            Severity::Info => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    CleartextProtocol,
    InsecureVersion,
    PortScan,
    OversizedPacket,
    BackdoorPort,
}

/// One threat or anomaly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatFinding {
    pub id: Uuid,
    pub category: ThreatCategory,
    pub severity: Severity,
    /// Assigned from the severity during merge unless a detector set it
    pub risk_score: Option<u8>,
    /// Frame that triggered (or, for aggregates, first contributed to) the finding
    pub frame: u64,
    pub timestamp: DateTime<Utc>,
    pub source: Option<IpAddr>,
    pub destination: Option<IpAddr>,
    pub port: Option<u16>,
    pub service: Option<String>,
    pub description: String,
}

impl ThreatFinding {
    pub(crate) fn from_packet(
        packet: &PacketRecord,
        category: ThreatCategory,
        severity: Severity,
        description: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            severity,
            risk_score: None,
            frame: packet.number,
            timestamp: packet.timestamp,
            source: packet.source,
            destination: packet.destination,
            port: packet.destination_port,
            service: None,
            description,
        }
    }

    /// Everything except the random id, for comparing runs
    pub fn fingerprint(&self) -> (u64, ThreatCategory, Severity, Option<u8>, Option<IpAddr>, Option<u16>, &str) {
        (
            self.frame,
            self.category,
            self.severity,
            self.risk_score,
            self.source,
            self.port,
            self.description.as_str(),
        )
    }
}

/// Per-severity counts and overall risk, derived in one pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreatMetrics {
    pub total: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
    /// Highest risk score among the findings (0 when there are none)
    pub overall_risk_score: u8,
    pub average_risk_score: f64,
}

impl ThreatMetrics {
    pub fn from_findings(findings: &[ThreatFinding]) -> Self {
        let mut metrics = ThreatMetrics::default();
        let mut score_sum = 0u64;
        for finding in findings {
            metrics.total += 1;
            match finding.severity {
                Severity::Critical => metrics.critical += 1,
                Severity::High => metrics.high += 1,
                Severity::Medium => metrics.medium += 1,
                Severity::Low => metrics.low += 1,
                Severity::Info => metrics.info += 1,
            }
            let score = finding.risk_score.unwrap_or_else(|| finding.severity.risk_score());
            metrics.overall_risk_score = metrics.overall_risk_score.max(score);
            score_sum += u64::from(score);
        }
        if metrics.total > 0 {
            metrics.average_risk_score = score_sum as f64 / metrics.total as f64;
        }
        metrics
    }
}

/// Output of one detection run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionReport {
    /// Sorted by (timestamp, frame)
    pub credentials: Vec<CredentialFinding>,
    /// Sorted by (timestamp, frame, category)
    pub threats: Vec<ThreatFinding>,
    pub metrics: ThreatMetrics,
    pub parallel: bool,
    pub chunks: usize,
    pub elapsed_ms: u64,
}
