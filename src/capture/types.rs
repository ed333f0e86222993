//! Capture container formats - constants and result types

use serde::Serialize;

use crate::common::binary::array4;
use crate::common::Endian;
use crate::error::{CapflowError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Classic global header size
pub const CLASSIC_HEADER_SIZE: usize = 24;
/// Classic per-record header size (ts_sec, ts_frac, incl_len, orig_len)
pub const CLASSIC_RECORD_HEADER_SIZE: usize = 16;
/// Classic magic, microsecond timestamps
pub const CLASSIC_MAGIC_MICROS: u32 = 0xA1B2_C3D4;
/// Classic magic, nanosecond timestamps
pub const CLASSIC_MAGIC_NANOS: u32 = 0xA1B2_3C4D;

/// Next-generation Section Header Block type (also the file magic)
pub const BLOCK_SECTION_HEADER: u32 = 0x0A0D_0D0A;
pub const BLOCK_INTERFACE_DESCRIPTION: u32 = 0x0000_0001;
/// Legacy Simple Packet Block
pub const BLOCK_SIMPLE_PACKET: u32 = 0x0000_0003;
pub const BLOCK_ENHANCED_PACKET: u32 = 0x0000_0006;
/// Byte-order magic carried in every Section Header Block
pub const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
/// Block type + block length + trailing block length
pub const BLOCK_MIN_SIZE: u32 = 12;

/// Upper bound on a single classic record's captured length
pub const MAX_RECORD_LENGTH: u32 = 256 * 1024 * 1024;

// =============================================================================
// Format detection
// =============================================================================

/// Timestamp resolution of a classic capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampResolution {
    Microseconds,
    Nanoseconds,
}

/// Container format identified from the leading bytes of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureFormat {
    Classic { endian: Endian, resolution: TimestampResolution },
    NextGeneration { endian: Endian },
}

impl CaptureFormat {
    pub fn endian(&self) -> Endian {
        match self {
            CaptureFormat::Classic { endian, .. } => *endian,
            CaptureFormat::NextGeneration { endian } => *endian,
        }
    }

    pub fn is_next_generation(&self) -> bool {
        matches!(self, CaptureFormat::NextGeneration { .. })
    }
}

/// Decode a Section Header Block's byte-order magic
pub fn byte_order_from_magic(bytes: [u8; 4]) -> Option<Endian> {
    if u32::from_le_bytes(bytes) == BYTE_ORDER_MAGIC {
        Some(Endian::Little)
    } else if u32::from_be_bytes(bytes) == BYTE_ORDER_MAGIC {
        Some(Endian::Big)
    } else {
        None
    }
}

/// Identify the container from its first bytes.
///
/// Classic files need 4 bytes; next-generation files need 12 so the
/// byte-order magic after the block header can be checked. The file's
/// byte order is whichever interpretation of the magic yields the
/// canonical value (`D4 C3 B2 A1` on disk is little-endian).
pub fn detect_format(header: &[u8]) -> Result<CaptureFormat> {
    if header.len() < 4 {
        return Err(CapflowError::Corrupt(format!(
            "header too short: {} bytes",
            header.len()
        )));
    }
    let magic = array4(header);

    if u32::from_le_bytes(magic) == BLOCK_SECTION_HEADER {
        if header.len() < 12 {
            return Err(CapflowError::Corrupt(
                "section header truncated before byte-order magic".to_string(),
            ));
        }
        return byte_order_from_magic(array4(&header[8..12]))
            .map(|endian| CaptureFormat::NextGeneration { endian })
            .ok_or_else(|| CapflowError::Corrupt("invalid byte-order magic".to_string()));
    }

    for endian in [Endian::Little, Endian::Big] {
        let resolution = match endian.u32(magic) {
            CLASSIC_MAGIC_MICROS => TimestampResolution::Microseconds,
            CLASSIC_MAGIC_NANOS => TimestampResolution::Nanoseconds,
            _ => continue,
        };
        return Ok(CaptureFormat::Classic { endian, resolution });
    }

    Err(CapflowError::NotFound(format!(
        "unrecognized capture magic {:02X} {:02X} {:02X} {:02X}",
        magic[0], magic[1], magic[2], magic[3]
    )))
}

// =============================================================================
// Results
// =============================================================================

/// Throttled progress observation from a header walk
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InspectProgress {
    pub percent: f64,
    pub bytes_read: u64,
    pub packets: u64,
    /// Bytes per second since the walk started
    pub throughput: f64,
}

/// Outcome of a header walk. Failures are reported here, never as `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct InspectionResult {
    pub success: bool,
    pub packet_count: u64,
    pub bytes_read: u64,
    pub is_next_generation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<CaptureFormat>,
    /// Link-layer type (classic global header, or the first interface block)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snap_length: Option<u32>,
    /// Number of section header blocks seen (next-generation only)
    pub sections: u32,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub elapsed_ms: u64,
}

impl InspectionResult {
    pub(crate) fn empty() -> Self {
        Self {
            success: false,
            packet_count: 0,
            bytes_read: 0,
            is_next_generation: false,
            format: None,
            link_type: None,
            snap_length: None,
            sections: 0,
            cancelled: false,
            error_message: None,
            elapsed_ms: 0,
        }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self { error_message: Some(message.into()), ..Self::empty() }
    }
}
