//! Header walker producing an early packet count
//!
//! Only record and block headers are read; payloads are skipped with a
//! relative seek. Anything the walker cannot make sense of ends up in
//! `InspectionResult::error_message` so callers can fall back to the
//! decoder's own count.

use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::types::*;
use crate::common::binary::{array4, read_full};
use crate::common::{CancelToken, Endian, Throttle};
use crate::error::{CapflowError, Result};
use crate::mapped::MappedCaptureFile;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Inspector tuning
#[derive(Debug, Clone)]
pub struct InspectOptions {
    /// Minimum spacing between progress callbacks
    pub progress_interval: Duration,
}

impl Default for InspectOptions {
    fn default() -> Self {
        Self { progress_interval: Duration::from_millis(200) }
    }
}

/// Inspect a capture file with default options and no progress reporting
pub fn inspect<P: AsRef<Path>>(path: P) -> InspectionResult {
    inspect_with(path, &InspectOptions::default(), &CancelToken::new(), None)
}

/// Inspect a capture file
pub fn inspect_with<P: AsRef<Path>>(
    path: P,
    options: &InspectOptions,
    cancel: &CancelToken,
    progress: Option<&dyn Fn(&InspectProgress)>,
) -> InspectionResult {
    let path = path.as_ref();
    let opened = MappedCaptureFile::open(path).and_then(|mapped| mapped.reader());
    match opened {
        Ok(reader) => {
            debug!(path = %path.display(), "Inspecting capture");
            inspect_reader(reader, options, cancel, progress)
        }
        Err(CapflowError::NotFound(_)) => {
            InspectionResult::failed(format!("File not found: {}", path.display()))
        }
        Err(e) => InspectionResult::failed(format!("Failed to open {}: {}", path.display(), e)),
    }
}

/// Inspect any seekable byte source
pub fn inspect_reader<R: Read + Seek>(
    reader: R,
    options: &InspectOptions,
    cancel: &CancelToken,
    progress: Option<&dyn Fn(&InspectProgress)>,
) -> InspectionResult {
    let started = Instant::now();
    let mut result = InspectionResult::empty();

    let mut walker = match Walker::new(reader, options, cancel, progress, started) {
        Ok(walker) => walker,
        Err(e) => {
            let mut failed = InspectionResult::failed(e.to_string());
            failed.elapsed_ms = started.elapsed().as_millis() as u64;
            return failed;
        }
    };

    let outcome = match detect_format(&walker.peek) {
        Ok(format) => {
            result.format = Some(format);
            result.is_next_generation = format.is_next_generation();
            match format {
                CaptureFormat::Classic { .. } => walker.walk_classic(&mut result),
                CaptureFormat::NextGeneration { .. } => walker.walk_sections(&mut result),
            }
        }
        Err(e) => Err(e),
    };

    result.packet_count = walker.packets;
    result.bytes_read = walker.pos.min(walker.size);
    result.elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(()) => result.success = true,
        Err(CapflowError::Cancelled) => {
            debug!(packets = walker.packets, "Inspection cancelled");
            result.cancelled = true;
            result.error_message = Some(CapflowError::Cancelled.to_string());
        }
        Err(e) => {
            warn!(error = %e, offset = walker.pos, "Capture inspection failed");
            result.error_message = Some(e.to_string());
        }
    }

    walker.emit();
    debug!(
        packets = result.packet_count,
        bytes = result.bytes_read,
        elapsed_ms = result.elapsed_ms,
        success = result.success,
        "Inspection finished"
    );
    result
}

struct Walker<'a, R: Read + Seek> {
    reader: BufReader<R>,
    /// First bytes of the source, for format detection
    peek: Vec<u8>,
    size: u64,
    pos: u64,
    packets: u64,
    cancel: &'a CancelToken,
    progress: Option<&'a dyn Fn(&InspectProgress)>,
    throttle: Throttle,
    started: Instant,
}

impl<'a, R: Read + Seek> Walker<'a, R> {
    fn new(
        mut reader: R,
        options: &InspectOptions,
        cancel: &'a CancelToken,
        progress: Option<&'a dyn Fn(&InspectProgress)>,
        started: Instant,
    ) -> io::Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let mut peek = vec![0u8; 12];
        let n = read_full(&mut reader, &mut peek)?;
        peek.truncate(n);
        reader.seek(SeekFrom::Start(0))?;

        Ok(Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, reader),
            peek,
            size,
            pos: 0,
            packets: 0,
            cancel,
            progress,
            throttle: Throttle::new(options.progress_interval),
            started,
        })
    }

    /// Fill `buf`; false when the source ended first
    fn read_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let n = read_full(&mut self.reader, buf)?;
        self.pos += n as u64;
        Ok(n == buf.len())
    }

    /// Skip `count` bytes; false when they run past the end of the source
    fn skip(&mut self, count: u64) -> Result<bool> {
        if self.pos + count > self.size {
            self.pos = self.size;
            return Ok(false);
        }
        self.reader.seek_relative(count as i64)?;
        self.pos += count;
        Ok(true)
    }

    fn record_packet(&mut self) {
        self.packets += 1;
        if self.progress.is_some() && self.throttle.ready() {
            self.emit();
        }
    }

    fn emit(&self) {
        let Some(callback) = self.progress else {
            return;
        };
        let bytes_read = self.pos.min(self.size);
        let secs = self.started.elapsed().as_secs_f64();
        let percent = if self.size > 0 {
            bytes_read as f64 / self.size as f64 * 100.0
        } else {
            100.0
        };
        callback(&InspectProgress {
            percent,
            bytes_read,
            packets: self.packets,
            throughput: if secs > 0.0 { bytes_read as f64 / secs } else { 0.0 },
        });
    }

    fn walk_classic(&mut self, result: &mut InspectionResult) -> Result<()> {
        let mut header = [0u8; CLASSIC_HEADER_SIZE];
        if !self.read_or_eof(&mut header)? {
            return Err(CapflowError::Corrupt("truncated global header".to_string()));
        }
        let endian = detect_format(&header)?.endian();
        result.snap_length = Some(endian.u32_at(&header, 16));
        result.link_type = Some(endian.u32_at(&header, 20));

        let mut record = [0u8; CLASSIC_RECORD_HEADER_SIZE];
        loop {
            self.cancel.check()?;
            let record_offset = self.pos;
            if !self.read_or_eof(&mut record)? {
                break;
            }
            let captured = endian.u32_at(&record, 8);
            if captured > MAX_RECORD_LENGTH {
                return Err(CapflowError::Corrupt(format!(
                    "record at offset {} claims {} captured bytes",
                    record_offset, captured
                )));
            }
            if !self.skip(captured as u64)? {
                break;
            }
            self.record_packet();
        }
        Ok(())
    }

    fn walk_sections(&mut self, result: &mut InspectionResult) -> Result<()> {
        let mut endian: Option<Endian> = None;
        let mut head = [0u8; 8];

        loop {
            self.cancel.check()?;
            let block_offset = self.pos;
            if !self.read_or_eof(&mut head)? {
                break;
            }

            // The section header type is a palindrome, readable before the byte order is known
            if u32::from_le_bytes(array4(&head)) == BLOCK_SECTION_HEADER {
                let mut magic = [0u8; 4];
                if !self.read_or_eof(&mut magic)? {
                    if endian.is_none() {
                        return Err(CapflowError::Corrupt("truncated section header".to_string()));
                    }
                    break;
                }
                let section_endian = byte_order_from_magic(magic).ok_or_else(|| {
                    CapflowError::Corrupt(format!(
                        "invalid byte-order magic in section header at offset {}",
                        block_offset
                    ))
                })?;
                endian = Some(section_endian);
                result.sections += 1;

                let length = section_endian.u32_at(&head, 4);
                check_block_length(length, block_offset)?;
                if !self.skip(u64::from(length) - 12)? {
                    break;
                }
                continue;
            }

            let Some(e) = endian else {
                return Err(CapflowError::Corrupt(
                    "first block is not a section header".to_string(),
                ));
            };
            let block_type = e.u32_at(&head, 0);
            let length = e.u32_at(&head, 4);
            check_block_length(length, block_offset)?;

            let mut remaining = u64::from(length) - 8;
            if block_type == BLOCK_INTERFACE_DESCRIPTION && result.link_type.is_none() && length >= 20 {
                let mut body = [0u8; 8];
                if !self.read_or_eof(&mut body)? {
                    break;
                }
                result.link_type = Some(u32::from(e.u16_at(&body, 0)));
                result.snap_length = Some(e.u32_at(&body, 4));
                remaining -= 8;
            }
            if !self.skip(remaining)? {
                break;
            }
            if block_type == BLOCK_ENHANCED_PACKET || block_type == BLOCK_SIMPLE_PACKET {
                self.record_packet();
            }
        }
        Ok(())
    }
}

fn check_block_length(length: u32, offset: u64) -> Result<()> {
    if length < BLOCK_MIN_SIZE || length % 4 != 0 {
        return Err(CapflowError::Corrupt(format!(
            "invalid block length {} at offset {}",
            length, offset
        )));
    }
    Ok(())
}
