//! Decoded packet records
//!
//! Records are produced by a [`crate::decoder::PacketSource`], appended in
//! decode order during loading and never mutated afterwards.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TCP flag bits carried in `PacketRecord::tcp_flags`
pub mod tcp_flags {
    pub const FIN: u16 = 0x01;
    pub const SYN: u16 = 0x02;
    pub const RST: u16 = 0x04;
    pub const PSH: u16 = 0x08;
    pub const ACK: u16 = 0x10;
}

/// Transport-layer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl Transport {
    /// Map an IP protocol number
    pub fn from_ip_proto(proto: u8) -> Self {
        match proto {
            6 => Transport::Tcp,
            17 => Transport::Udp,
            1 | 58 => Transport::Icmp,
            _ => Transport::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
            Transport::Icmp => "ICMP",
            Transport::Other => "OTHER",
        }
    }
}

/// Per-protocol credential fields pulled out of a packet by the decoder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRawFields {
    /// Full HTTP `Authorization` header value
    pub http_authorization: Option<String>,
    pub ftp_command: Option<String>,
    pub ftp_argument: Option<String>,
    pub smtp_command: Option<String>,
    pub smtp_parameter: Option<String>,
    /// Decoded AUTH LOGIN continuation values
    pub smtp_auth_username: Option<String>,
    pub smtp_auth_password: Option<String>,
    pub imap_command: Option<String>,
    pub imap_parameter: Option<String>,
    pub pop3_command: Option<String>,
    pub pop3_parameter: Option<String>,
    pub ldap_bind_name: Option<String>,
    pub ldap_simple_password: Option<String>,
    pub snmp_community: Option<String>,
    pub kerberos_principal: Option<String>,
    pub kerberos_realm: Option<String>,
    pub ntlm_username: Option<String>,
    pub ntlm_domain: Option<String>,
    pub mysql_user: Option<String>,
    pub mysql_password: Option<String>,
    pub pgsql_user: Option<String>,
    pub pgsql_password: Option<String>,
}

impl CredentialRawFields {
    /// Fast-reject gate: true when any field carries data
    pub fn has_credential_data(&self) -> bool {
        [
            &self.http_authorization,
            &self.ftp_command,
            &self.ftp_argument,
            &self.smtp_command,
            &self.smtp_parameter,
            &self.smtp_auth_username,
            &self.smtp_auth_password,
            &self.imap_command,
            &self.imap_parameter,
            &self.pop3_command,
            &self.pop3_parameter,
            &self.ldap_bind_name,
            &self.ldap_simple_password,
            &self.snmp_community,
            &self.kerberos_principal,
            &self.kerberos_realm,
            &self.ntlm_username,
            &self.ntlm_domain,
            &self.mysql_user,
            &self.mysql_password,
            &self.pgsql_user,
            &self.pgsql_password,
        ]
        .iter()
        .any(|f| f.as_deref().map_or(false, |s| !s.is_empty()))
    }
}

/// One decoded packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Frame number in the capture (1-based)
    pub number: u64,
    pub timestamp: DateTime<Utc>,
    pub source: Option<IpAddr>,
    pub destination: Option<IpAddr>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub transport: Transport,
    /// Highest decoded protocol label ("HTTP", "TLS", "DNS", ...)
    pub protocol: String,
    /// Frame length on the wire
    pub length: u32,
    pub tcp_flags: Option<u16>,
    pub info: String,
    /// Extensible decoder metadata ("tls.version", "smb.version", ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialRawFields>,
}

impl PacketRecord {
    /// Minimal record; remaining fields are filled with builder methods
    pub fn new(number: u64, timestamp: DateTime<Utc>, protocol: &str, length: u32) -> Self {
        Self {
            number,
            timestamp,
            source: None,
            destination: None,
            source_port: None,
            destination_port: None,
            transport: Transport::Other,
            protocol: protocol.to_string(),
            length,
            tcp_flags: None,
            info: String::new(),
            metadata: HashMap::new(),
            credentials: None,
        }
    }

    pub fn with_endpoints(
        mut self,
        source: IpAddr,
        source_port: Option<u16>,
        destination: IpAddr,
        destination_port: Option<u16>,
    ) -> Self {
        self.source = Some(source);
        self.source_port = source_port;
        self.destination = Some(destination);
        self.destination_port = destination_port;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_tcp_flags(mut self, flags: u16) -> Self {
        self.tcp_flags = Some(flags);
        self
    }

    pub fn with_info(mut self, info: &str) -> Self {
        self.info = info.to_string();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_credentials(mut self, fields: CredentialRawFields) -> Self {
        self.credentials = Some(fields);
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// TCP SYN without ACK (connection attempt)
    pub fn is_syn_only(&self) -> bool {
        match self.tcp_flags {
            Some(flags) => flags & tcp_flags::SYN != 0 && flags & tcp_flags::ACK == 0,
            None => false,
        }
    }

    /// Credential fields, only if the decoder found any
    pub fn credential_fields(&self) -> Option<&CredentialRawFields> {
        self.credentials.as_ref().filter(|c| c.has_credential_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_has_credential_data() {
        let mut fields = CredentialRawFields::default();
        assert!(!fields.has_credential_data());
        fields.snmp_community = Some(String::new());
        assert!(!fields.has_credential_data());
        fields.snmp_community = Some("public".into());
        assert!(fields.has_credential_data());
    }

    #[test]
    fn test_builder_and_flags() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let packet = PacketRecord::new(1, ts, "TCP", 60)
            .with_endpoints("10.0.0.1".parse().unwrap(), Some(40000), "10.0.0.2".parse().unwrap(), Some(22))
            .with_transport(Transport::Tcp)
            .with_tcp_flags(tcp_flags::SYN)
            .with_metadata("tls.version", "0x0301");

        assert!(packet.is_syn_only());
        assert_eq!(packet.meta("tls.version"), Some("0x0301"));
        assert!(packet.credential_fields().is_none());

        let synack = packet.clone().with_tcp_flags(tcp_flags::SYN | tcp_flags::ACK);
        assert!(!synack.is_syn_only());
    }

    #[test]
    fn test_transport_mapping() {
        assert_eq!(Transport::from_ip_proto(6), Transport::Tcp);
        assert_eq!(Transport::from_ip_proto(17), Transport::Udp);
        assert_eq!(Transport::from_ip_proto(58), Transport::Icmp);
        assert_eq!(Transport::from_ip_proto(47), Transport::Other);
    }
}
