//! tshark-backed packet source
//!
//! Runs `tshark -T fields` with a fixed field list and parses the
//! tab-separated output. Only the first occurrence of each field is kept.

use std::borrow::Cow;
use std::io::{self, BufRead, BufReader, Read};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use super::{CountProgress, PacketSource, PacketStream};
use crate::capture::{self, InspectOptions};
use crate::common::CancelToken;
use crate::error::{CapflowError, Result};
use crate::packet::{CredentialRawFields, PacketRecord, Transport};
use crate::pool::ByteBufferPool;

/// Fields requested from tshark, in output column order
pub const FIELDS: &[&str] = &[
    "frame.number",
    "frame.time_epoch",
    "frame.len",
    "ip.src",
    "ip.dst",
    "ipv6.src",
    "ipv6.dst",
    "ip.proto",
    "tcp.srcport",
    "tcp.dstport",
    "udp.srcport",
    "udp.dstport",
    "tcp.flags",
    "_ws.col.Protocol",
    "_ws.col.Info",
    "tls.record.version",
    "smb.cmd",
    "snmp.version",
    "http.authorization",
    "ftp.request.command",
    "ftp.request.arg",
    "smtp.req.command",
    "smtp.req.parameter",
    "smtp.auth.username",
    "smtp.auth.password",
    "imap.request.command",
    "imap.request",
    "pop.request.command",
    "pop.request.parameter",
    "ldap.name",
    "ldap.simple",
    "snmp.community",
    "kerberos.CNameString",
    "kerberos.realm",
    "ntlmssp.auth.username",
    "ntlmssp.auth.domain",
    "mysql.user",
    "mysql.passwd",
    "pgsql.parameter_name",
    "pgsql.parameter_value",
    "pgsql.password",
];

// Column indices into FIELDS
const COL_NUMBER: usize = 0;
const COL_TIME: usize = 1;
const COL_LEN: usize = 2;
const COL_IP_SRC: usize = 3;
const COL_IP_DST: usize = 4;
const COL_IP6_SRC: usize = 5;
const COL_IP6_DST: usize = 6;
const COL_IP_PROTO: usize = 7;
const COL_TCP_SRC: usize = 8;
const COL_TCP_DST: usize = 9;
const COL_UDP_SRC: usize = 10;
const COL_UDP_DST: usize = 11;
const COL_TCP_FLAGS: usize = 12;
const COL_PROTOCOL: usize = 13;
const COL_INFO: usize = 14;
const COL_TLS_VERSION: usize = 15;
const COL_SMB_CMD: usize = 16;
const COL_SNMP_VERSION: usize = 17;
const COL_CREDENTIALS: usize = 18;

/// Initial line buffer size; a bucket size of the byte pool
const LINE_BUFFER_SIZE: usize = 4096;

/// Packet source that shells out to tshark
#[derive(Clone)]
pub struct TsharkSource {
    tshark_path: PathBuf,
    inspect: InspectOptions,
    buffers: Arc<ByteBufferPool>,
}

impl Default for TsharkSource {
    fn default() -> Self {
        Self::new("tshark")
    }
}

impl TsharkSource {
    pub fn new<P: Into<PathBuf>>(tshark_path: P) -> Self {
        Self {
            tshark_path: tshark_path.into(),
            inspect: InspectOptions::default(),
            buffers: Arc::new(ByteBufferPool::default()),
        }
    }

    /// Options for the header walk behind [`PacketSource::count_packets`]
    pub fn with_inspect_options(mut self, options: InspectOptions) -> Self {
        self.inspect = options;
        self
    }

    /// Share a line buffer pool between sources
    pub fn with_buffer_pool(mut self, buffers: Arc<ByteBufferPool>) -> Self {
        self.buffers = buffers;
        self
    }

    fn base_command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.tshark_path);
        cmd.arg("-r").arg(path).arg("-n").args(["-T", "fields"]);
        cmd
    }

    fn spawn(&self, mut cmd: Command) -> Result<Child> {
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                CapflowError::Decoder(format!(
                    "failed to start {}: {}",
                    self.tshark_path.display(),
                    e
                ))
            })
    }

    /// Count frames by asking tshark for frame numbers only
    fn count_with_tshark(&self, path: &Path) -> Result<u64> {
        let mut cmd = self.base_command(path);
        cmd.args(["-e", "frame.number"]);
        let output = cmd
            .output()
            .map_err(|e| CapflowError::Decoder(format!("failed to run tshark: {}", e)))?;
        if !output.status.success() {
            return Err(CapflowError::Decoder(format!(
                "tshark exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count() as u64)
    }
}

impl PacketSource for TsharkSource {
    fn name(&self) -> &str {
        "tshark"
    }

    fn count_packets(&self, path: &Path, cancel: &CancelToken, progress: CountProgress<'_>) -> Result<u64> {
        let inspection = capture::inspect_with(path, &self.inspect, cancel, progress);
        if inspection.cancelled {
            return Err(CapflowError::Cancelled);
        }
        if inspection.success {
            return Ok(inspection.packet_count);
        }
        debug!(
            error = inspection.error_message.as_deref().unwrap_or(""),
            "Header walk failed, counting with tshark"
        );
        cancel.check()?;
        self.count_with_tshark(path)
    }

    fn open(&self, path: &Path, cancel: &CancelToken) -> Result<PacketStream> {
        let mut cmd = self.base_command(path);
        cmd.args(["-E", "separator=/t", "-E", "occurrence=f", "-E", "quote=n", "-E", "header=n"]);
        for field in FIELDS {
            cmd.args(["-e", *field]);
        }

        let mut child = self.spawn(cmd)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapflowError::Decoder("tshark stdout unavailable".to_string()))?;
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::Builder::new()
                .name("capflow-tshark-stderr".to_string())
                .spawn(move || {
                    let mut text = String::new();
                    let _ = pipe.read_to_string(&mut text);
                    text
                })
        });
        let stderr = match stderr {
            Some(Ok(handle)) => Some(handle),
            Some(Err(e)) => {
                warn!(error = %e, "Could not spawn stderr reader for tshark");
                None
            }
            None => None,
        };

        info!(path = %path.display(), fields = FIELDS.len(), "tshark started");
        Ok(Box::new(TsharkStream {
            child: Some(child),
            reader: BufReader::with_capacity(256 * 1024, stdout),
            line: LineBuffer::rent(&self.buffers),
            stderr,
            cancel: cancel.clone(),
        }))
    }
}

struct TsharkStream {
    /// `None` once the process has been reaped
    child: Option<Child>,
    reader: BufReader<ChildStdout>,
    line: LineBuffer,
    stderr: Option<JoinHandle<String>>,
    cancel: CancelToken,
}

impl TsharkStream {
    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "tshark already exited");
            }
            let _ = child.wait();
        }
    }

    /// Reap the process at end of output; a non-zero exit is a decode failure
    fn finish(&mut self) -> Option<Result<PacketRecord>> {
        let mut child = self.child.take()?;
        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => return Some(Err(CapflowError::Decoder(format!("failed to reap tshark: {}", e)))),
        };
        if status.success() {
            debug!("tshark finished");
            return None;
        }
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        Some(Err(CapflowError::Decoder(format!(
            "tshark exited with {}: {}",
            status,
            stderr.trim()
        ))))
    }
}

impl Iterator for TsharkStream {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.child.as_ref()?;
        if self.cancel.is_cancelled() {
            self.kill();
            return Some(Err(CapflowError::Cancelled));
        }
        match read_record(&mut self.reader, &mut self.line.buf) {
            Ok(Some(parsed)) => {
                if parsed.is_err() {
                    self.kill();
                }
                Some(parsed)
            }
            Ok(None) => self.finish(),
            Err(e) => {
                self.kill();
                Some(Err(CapflowError::Decoder(format!("failed reading tshark output: {}", e))))
            }
        }
    }
}

impl Drop for TsharkStream {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Line buffer rented from a [`ByteBufferPool`] and handed back on drop
struct LineBuffer {
    pool: Arc<ByteBufferPool>,
    buf: Vec<u8>,
}

impl LineBuffer {
    fn rent(pool: &Arc<ByteBufferPool>) -> Self {
        let mut buf = pool.rent(LINE_BUFFER_SIZE);
        buf.clear();
        Self { pool: Arc::clone(pool), buf }
    }
}

impl Drop for LineBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        // Only a buffer that can hold a full bucket goes back
        if buf.capacity() >= LINE_BUFFER_SIZE {
            buf.resize(LINE_BUFFER_SIZE, 0);
            self.pool.release(buf);
        }
    }
}

/// Read and parse the next output line; `None` at end of output.
///
/// Bytes that are not valid UTF-8 are replaced rather than failing the read.
fn read_record<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<Option<Result<PacketRecord>>> {
    line.clear();
    if reader.read_until(b'\n', line)? == 0 {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(line);
    if let Cow::Owned(_) = text {
        debug!(bytes = line.len(), "Replaced invalid UTF-8 in tshark output");
    }
    Ok(Some(parse_line(&text)))
}

/// Parse one tab-separated tshark line into a record
pub fn parse_line(line: &str) -> Result<PacketRecord> {
    let cols: Vec<&str> = line.trim_end_matches(&['\r', '\n'][..]).split('\t').collect();
    let col = |i: usize| cols.get(i).map(|s| s.trim()).filter(|s| !s.is_empty());

    let number: u64 = col(COL_NUMBER)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(line, "frame number"))?;
    let timestamp = col(COL_TIME)
        .and_then(parse_epoch)
        .ok_or_else(|| malformed(line, "timestamp"))?;
    let length: u32 = col(COL_LEN)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(line, "frame length"))?;

    let protocol = col(COL_PROTOCOL).unwrap_or("UNKNOWN");
    let mut packet = PacketRecord::new(number, timestamp, protocol, length);
    packet.info = col(COL_INFO).unwrap_or_default().to_string();

    let parse_ip = |i: usize| col(i).and_then(|s| s.parse::<IpAddr>().ok());
    packet.source = parse_ip(COL_IP_SRC).or_else(|| parse_ip(COL_IP6_SRC));
    packet.destination = parse_ip(COL_IP_DST).or_else(|| parse_ip(COL_IP6_DST));

    let parse_port = |i: usize| col(i).and_then(|s| s.parse::<u16>().ok());
    if let Some(src) = parse_port(COL_TCP_SRC) {
        packet.transport = Transport::Tcp;
        packet.source_port = Some(src);
        packet.destination_port = parse_port(COL_TCP_DST);
        packet.tcp_flags = col(COL_TCP_FLAGS).and_then(parse_hex_u16);
    } else if let Some(src) = parse_port(COL_UDP_SRC) {
        packet.transport = Transport::Udp;
        packet.source_port = Some(src);
        packet.destination_port = parse_port(COL_UDP_DST);
    } else if let Some(proto) = col(COL_IP_PROTO).and_then(|s| s.parse::<u8>().ok()) {
        packet.transport = Transport::from_ip_proto(proto);
    }

    if let Some(version) = col(COL_TLS_VERSION) {
        packet.metadata.insert("tls.version".to_string(), version.to_string());
    }
    if col(COL_SMB_CMD).is_some() {
        packet.metadata.insert("smb.version".to_string(), "1".to_string());
    }
    if let Some(version) = col(COL_SNMP_VERSION) {
        packet.metadata.insert("snmp.version".to_string(), version.to_string());
    }

    let text = |offset: usize| col(COL_CREDENTIALS + offset).map(str::to_string);
    let pgsql_user = match col(COL_CREDENTIALS + 20) {
        Some("user") => text(21),
        _ => None,
    };
    let credentials = CredentialRawFields {
        http_authorization: text(0),
        ftp_command: text(1),
        ftp_argument: text(2),
        smtp_command: text(3),
        smtp_parameter: text(4),
        smtp_auth_username: text(5),
        smtp_auth_password: text(6),
        imap_command: text(7),
        imap_parameter: text(8).map(|req| imap_arguments(&req)),
        pop3_command: text(9),
        pop3_parameter: text(10),
        ldap_bind_name: text(11),
        ldap_simple_password: text(12),
        snmp_community: text(13),
        kerberos_principal: text(14),
        kerberos_realm: text(15),
        ntlm_username: text(16),
        ntlm_domain: text(17),
        mysql_user: text(18),
        mysql_password: text(19),
        pgsql_user,
        pgsql_password: text(22),
    };
    if credentials.has_credential_data() {
        packet.credentials = Some(credentials);
    }

    Ok(packet)
}

fn malformed(line: &str, what: &str) -> CapflowError {
    let preview: String = line.chars().take(80).collect();
    CapflowError::Decoder(format!("malformed tshark line ({}): {}", what, preview))
}

/// Parse "seconds.fraction" into a UTC timestamp
fn parse_epoch(s: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs: i64 = secs.parse().ok()?;
    let mut nanos: u32 = 0;
    if !frac.is_empty() {
        let digits: String = frac.chars().take(9).collect();
        let scale = 10u32.pow(9 - digits.len() as u32);
        nanos = digits.parse::<u32>().ok()? * scale;
    }
    Utc.timestamp_opt(secs, nanos).single()
}

fn parse_hex_u16(s: &str) -> Option<u16> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(digits, 16).ok()
}

/// "a001 LOGIN user pass" -> "user pass"
fn imap_arguments(request: &str) -> String {
    request.splitn(3, ' ').nth(2).unwrap_or_default().to_string()
}
