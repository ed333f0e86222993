//! Multi-protocol credential extraction
//!
//! Extractors run in a fixed priority order and the first one that
//! produces a finding wins, so a packet yields at most one finding.
//!
//! SMTP AUTH LOGIN sends the username and password on separate lines.
//! Each line is reported as its own finding: the AUTH command itself is
//! recorded without credentials, and continuation packets carry the
//! decoded username or password.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;

use super::types::{CredentialFinding, CredentialProtocol};
use crate::packet::{CredentialRawFields, PacketRecord};

type Extractor = fn(&PacketRecord, &CredentialRawFields) -> Option<CredentialFinding>;

/// Priority order
const EXTRACTORS: &[Extractor] = &[
    http, ftp, smtp, imap, pop3, ldap, snmp, kerberos, ntlm, mysql, postgres,
];

/// Run the extractors over one packet
pub fn extract(packet: &PacketRecord) -> Option<CredentialFinding> {
    let fields = packet.credential_fields()?;
    EXTRACTORS.iter().find_map(|extractor| extractor(packet, fields))
}

fn digest_param_regex() -> &'static Regex {
    static DIGEST_PARAM: OnceLock<Regex> = OnceLock::new();
    DIGEST_PARAM.get_or_init(|| {
        Regex::new(r#"(?i)\b(username|realm)\s*=\s*"?([^",]*)"?"#).expect("Invalid digest regex")
    })
}

fn decode_base64_text(input: &str) -> Option<String> {
    let bytes = STANDARD.decode(input.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn http(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let header = non_empty(&fields.http_authorization)?;
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        let finding = CredentialFinding::from_packet(packet, CredentialProtocol::HttpBasic);
        return Some(match decode_base64_text(rest).as_deref().and_then(|s| s.split_once(':')) {
            Some((user, pass)) => finding.user(user).password(pass),
            None => finding.context("undecodable Basic credentials"),
        });
    }

    if scheme.eq_ignore_ascii_case("digest") {
        let mut finding = CredentialFinding::from_packet(packet, CredentialProtocol::HttpDigest)
            .context("Digest response (password not recoverable)");
        for caps in digest_param_regex().captures_iter(rest) {
            let value = caps[2].trim().to_string();
            if caps[1].eq_ignore_ascii_case("username") {
                finding.username = Some(value);
            } else {
                finding.domain = Some(value);
            }
        }
        return Some(finding);
    }

    None
}

fn ftp(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let command = non_empty(&fields.ftp_command)?;
    let argument = non_empty(&fields.ftp_argument).unwrap_or("");
    let finding = CredentialFinding::from_packet(packet, CredentialProtocol::Ftp);
    match command.to_ascii_uppercase().as_str() {
        "USER" => Some(finding.user(argument).context("USER command")),
        "PASS" => Some(finding.password(argument).context("PASS command")),
        _ => None,
    }
}

fn smtp(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let finding = || CredentialFinding::from_packet(packet, CredentialProtocol::Smtp);

    // AUTH LOGIN continuation lines
    let username = non_empty(&fields.smtp_auth_username);
    let password = non_empty(&fields.smtp_auth_password);
    if username.is_some() || password.is_some() {
        let mut f = finding().context("AUTH LOGIN continuation");
        f.username = username.map(str::to_string);
        f.password = password.map(str::to_string);
        return Some(f);
    }

    let command = non_empty(&fields.smtp_command)?;
    if !command.eq_ignore_ascii_case("AUTH") {
        return None;
    }
    let parameter = non_empty(&fields.smtp_parameter).unwrap_or("");
    let mut parts = parameter.split_whitespace();
    let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
    let initial = parts.next();

    match mechanism.as_str() {
        "PLAIN" => {
            let f = finding().context("AUTH PLAIN");
            // authzid \0 authcid \0 password
            let decoded = initial.and_then(decode_base64_text);
            Some(match decoded {
                Some(text) => {
                    let mut pieces = text.split('\0');
                    let _authzid = pieces.next();
                    match (pieces.next(), pieces.next()) {
                        (Some(user), Some(pass)) => f.user(user).password(pass),
                        _ => f,
                    }
                }
                None => f,
            })
        }
        "LOGIN" => {
            let f = finding().context("AUTH LOGIN initiated");
            Some(match initial.and_then(decode_base64_text) {
                Some(user) => f.user(user),
                None => f,
            })
        }
        "" => None,
        other => Some(finding().context(format!("AUTH {}", other))),
    }
}

/// Split "user pass" honouring double quotes
fn split_login_args(parameter: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in parameter.chars() {
        match ch {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn imap(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let command = non_empty(&fields.imap_command)?;
    let finding = CredentialFinding::from_packet(packet, CredentialProtocol::Imap);
    match command.to_ascii_uppercase().as_str() {
        "LOGIN" => {
            let args = split_login_args(non_empty(&fields.imap_parameter).unwrap_or(""));
            let mut f = finding.context("LOGIN command");
            f.username = args.first().cloned();
            f.password = args.get(1).cloned();
            Some(f)
        }
        "AUTHENTICATE" => Some(finding.context(format!(
            "AUTHENTICATE {}",
            non_empty(&fields.imap_parameter).unwrap_or("")
        ))),
        _ => None,
    }
}

fn pop3(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let command = non_empty(&fields.pop3_command)?;
    let parameter = non_empty(&fields.pop3_parameter).unwrap_or("");
    let finding = CredentialFinding::from_packet(packet, CredentialProtocol::Pop3);
    match command.to_ascii_uppercase().as_str() {
        "USER" => Some(finding.user(parameter).context("USER command")),
        "PASS" => Some(finding.password(parameter).context("PASS command")),
        "APOP" => {
            let user = parameter.split_whitespace().next().unwrap_or("");
            Some(finding.user(user).context("APOP digest"))
        }
        _ => None,
    }
}

fn ldap(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let name = non_empty(&fields.ldap_bind_name);
    let password = non_empty(&fields.ldap_simple_password);
    if name.is_none() && password.is_none() {
        return None;
    }
    let mut finding =
        CredentialFinding::from_packet(packet, CredentialProtocol::Ldap).context("simple bind");
    finding.username = name.map(str::to_string);
    finding.password = password.map(str::to_string);
    Some(finding)
}

fn snmp(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let community = non_empty(&fields.snmp_community)?;
    Some(
        CredentialFinding::from_packet(packet, CredentialProtocol::Snmp)
            .password(community)
            .context("community string"),
    )
}

fn kerberos(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let principal = non_empty(&fields.kerberos_principal)?;
    let mut finding = CredentialFinding::from_packet(packet, CredentialProtocol::Kerberos)
        .user(principal)
        .context("principal name");
    finding.domain = non_empty(&fields.kerberos_realm).map(str::to_string);
    Some(finding)
}

fn ntlm(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let user = non_empty(&fields.ntlm_username)?;
    let mut finding = CredentialFinding::from_packet(packet, CredentialProtocol::Ntlm)
        .user(user)
        .context("NTLMSSP authenticate");
    if let Some(domain) = non_empty(&fields.ntlm_domain) {
        finding = finding.domain(domain);
    }
    Some(finding)
}

fn mysql(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let user = non_empty(&fields.mysql_user)?;
    let mut finding = CredentialFinding::from_packet(packet, CredentialProtocol::MySql)
        .user(user)
        .context("login request");
    finding.password = non_empty(&fields.mysql_password).map(str::to_string);
    Some(finding)
}

fn postgres(packet: &PacketRecord, fields: &CredentialRawFields) -> Option<CredentialFinding> {
    let user = non_empty(&fields.pgsql_user);
    let password = non_empty(&fields.pgsql_password);
    if user.is_none() && password.is_none() {
        return None;
    }
    let mut finding = CredentialFinding::from_packet(packet, CredentialProtocol::PostgreSql);
    finding.username = user.map(str::to_string);
    finding.password = password.map(str::to_string);
    Some(finding.context(if password.is_some() { "password message" } else { "startup message" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn packet(fields: CredentialRawFields) -> PacketRecord {
        PacketRecord::new(10, Utc::now(), "TCP", 100)
            .with_endpoints("10.0.0.1".parse().unwrap(), Some(50000), "10.0.0.2".parse().unwrap(), Some(80))
            .with_credentials(fields)
    }

    #[test]
    fn test_no_credential_data() {
        assert!(extract(&PacketRecord::new(1, Utc::now(), "TCP", 60)).is_none());
        assert!(extract(&packet(CredentialRawFields::default())).is_none());
    }

    #[test]
    fn test_http_basic() {
        let f = extract(&packet(CredentialRawFields {
            http_authorization: Some("Basic YWxpY2U6czNjcmV0".into()), // alice:s3cret
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::HttpBasic);
        assert_eq!(f.username.as_deref(), Some("alice"));
        assert_eq!(f.password.as_deref(), Some("s3cret"));
        assert_eq!(f.frame, 10);
        assert_eq!(f.destination_port, Some(80));
    }

    #[test]
    fn test_http_digest() {
        let f = extract(&packet(CredentialRawFields {
            http_authorization: Some(
                r#"Digest username="bob", realm="intranet", nonce="abc", response="def""#.into(),
            ),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::HttpDigest);
        assert_eq!(f.username.as_deref(), Some("bob"));
        assert_eq!(f.domain.as_deref(), Some("intranet"));
        assert!(f.password.is_none());
    }

    #[test]
    fn test_ftp_user_and_pass_are_separate() {
        let user = extract(&packet(CredentialRawFields {
            ftp_command: Some("USER".into()),
            ftp_argument: Some("anonymous".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(user.username.as_deref(), Some("anonymous"));
        assert!(user.password.is_none());

        let pass = extract(&packet(CredentialRawFields {
            ftp_command: Some("pass".into()),
            ftp_argument: Some("guest@".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(pass.password.as_deref(), Some("guest@"));

        assert!(extract(&packet(CredentialRawFields {
            ftp_command: Some("LIST".into()),
            ..Default::default()
        }))
        .is_none());
    }

    #[test]
    fn test_smtp_auth_plain() {
        // \0user\0pass
        let f = extract(&packet(CredentialRawFields {
            smtp_command: Some("AUTH".into()),
            smtp_parameter: Some("PLAIN AHVzZXIAcGFzcw==".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::Smtp);
        assert_eq!(f.username.as_deref(), Some("user"));
        assert_eq!(f.password.as_deref(), Some("pass"));
    }

    #[test]
    fn test_smtp_auth_login_sequence() {
        let initiation = extract(&packet(CredentialRawFields {
            smtp_command: Some("AUTH".into()),
            smtp_parameter: Some("LOGIN".into()),
            ..Default::default()
        }))
        .unwrap();
        assert!(initiation.username.is_none());
        assert!(initiation.password.is_none());
        assert_eq!(initiation.context.as_deref(), Some("AUTH LOGIN initiated"));

        let username = extract(&packet(CredentialRawFields {
            smtp_auth_username: Some("mailer".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(username.username.as_deref(), Some("mailer"));
        assert_eq!(username.context.as_deref(), Some("AUTH LOGIN continuation"));

        let password = extract(&packet(CredentialRawFields {
            smtp_auth_password: Some("hunter2".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(password.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_imap_login_quoted() {
        let f = extract(&packet(CredentialRawFields {
            imap_command: Some("login".into()),
            imap_parameter: Some(r#""jane doe" "pa ss""#.into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.username.as_deref(), Some("jane doe"));
        assert_eq!(f.password.as_deref(), Some("pa ss"));
    }

    #[test]
    fn test_pop3_and_snmp() {
        let f = extract(&packet(CredentialRawFields {
            pop3_command: Some("USER".into()),
            pop3_parameter: Some("carol".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::Pop3);

        let f = extract(&packet(CredentialRawFields {
            snmp_community: Some("public".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::Snmp);
        assert_eq!(f.password.as_deref(), Some("public"));
    }

    #[test]
    fn test_directory_and_database_protocols() {
        let f = extract(&packet(CredentialRawFields {
            kerberos_principal: Some("administrator".into()),
            kerberos_realm: Some("CORP.LOCAL".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::Kerberos);
        assert_eq!(f.domain.as_deref(), Some("CORP.LOCAL"));

        let f = extract(&packet(CredentialRawFields {
            ntlm_username: Some("svc_backup".into()),
            ntlm_domain: Some("CORP".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::Ntlm);

        let f = extract(&packet(CredentialRawFields {
            ldap_bind_name: Some("cn=admin,dc=example,dc=org".into()),
            ldap_simple_password: Some("secret".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::Ldap);

        let f = extract(&packet(CredentialRawFields {
            mysql_user: Some("root".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::MySql);

        let f = extract(&packet(CredentialRawFields {
            pgsql_password: Some("md5abcdef".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::PostgreSql);
        assert_eq!(f.context.as_deref(), Some("password message"));
    }

    #[test]
    fn test_priority_order_first_match_wins() {
        let f = extract(&packet(CredentialRawFields {
            http_authorization: Some("Basic YWxpY2U6czNjcmV0".into()),
            snmp_community: Some("public".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::HttpBasic);

        // FTP command without credentials falls through to the next extractor
        let f = extract(&packet(CredentialRawFields {
            ftp_command: Some("RETR".into()),
            snmp_community: Some("private".into()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(f.protocol, CredentialProtocol::Snmp);
    }
}
