//! External decoder contract
//!
//! The pipeline never decodes application protocols itself. A
//! [`PacketSource`] turns a capture path into a cancellable stream of
//! [`PacketRecord`]s and answers a cheap "how many packets" query.

pub mod tshark;

use std::path::Path;

use crate::capture::InspectProgress;
use crate::common::CancelToken;
use crate::error::{CapflowError, Result};
use crate::packet::PacketRecord;

pub use tshark::TsharkSource;

/// Decoded packets in capture order. A decode failure is yielded as an
/// `Err` item and ends the stream.
pub type PacketStream = Box<dyn Iterator<Item = Result<PacketRecord>> + Send>;

/// Progress sink for [`PacketSource::count_packets`]
pub type CountProgress<'a> = Option<&'a dyn Fn(&InspectProgress)>;

/// Something that can decode a capture file
pub trait PacketSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Cheap total packet count (0 when unknown). Returns `Cancelled`
    /// once `cancel` fires.
    fn count_packets(&self, path: &Path, cancel: &CancelToken, progress: CountProgress<'_>) -> Result<u64>;

    /// Start decoding. The stream checks `cancel` between records.
    fn open(&self, path: &Path, cancel: &CancelToken) -> Result<PacketStream>;
}

/// In-memory source, for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    packets: Vec<PacketRecord>,
    reported_count: Option<u64>,
    fail_after: Option<usize>,
}

impl VecSource {
    pub fn new(packets: Vec<PacketRecord>) -> Self {
        Self { packets, reported_count: None, fail_after: None }
    }

    /// Report this count instead of the real length
    pub fn with_reported_count(mut self, count: u64) -> Self {
        self.reported_count = Some(count);
        self
    }

    /// Yield a decoder error after `n` records
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl PacketSource for VecSource {
    fn name(&self) -> &str {
        "memory"
    }

    fn count_packets(&self, _path: &Path, cancel: &CancelToken, _progress: CountProgress<'_>) -> Result<u64> {
        cancel.check()?;
        Ok(self.reported_count.unwrap_or(self.packets.len() as u64))
    }

    fn open(&self, _path: &Path, cancel: &CancelToken) -> Result<PacketStream> {
        Ok(Box::new(VecStream {
            packets: self.packets.clone().into_iter(),
            yielded: 0,
            fail_after: self.fail_after,
            cancel: cancel.clone(),
            done: false,
        }))
    }
}

struct VecStream {
    packets: std::vec::IntoIter<PacketRecord>,
    yielded: usize,
    fail_after: Option<usize>,
    cancel: CancelToken,
    done: bool,
}

impl Iterator for VecStream {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(CapflowError::Cancelled));
        }
        if self.fail_after == Some(self.yielded) {
            self.done = true;
            return Some(Err(CapflowError::Decoder(format!(
                "decoder failed after {} records",
                self.yielded
            ))));
        }
        let packet = self.packets.next()?;
        self.yielded += 1;
        Some(Ok(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn packets(n: u64) -> Vec<PacketRecord> {
        (1..=n).map(|i| PacketRecord::new(i, Utc::now(), "TCP", 60)).collect()
    }

    #[test]
    fn test_vec_source_streams_in_order() {
        let source = VecSource::new(packets(5));
        let numbers: Vec<u64> = source
            .open(Path::new("mem"), &CancelToken::new())
            .unwrap()
            .map(|p| p.unwrap().number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        let cancel = CancelToken::new();
        assert_eq!(source.count_packets(Path::new("mem"), &cancel, None).unwrap(), 5);
        assert_eq!(
            source.with_reported_count(0).count_packets(Path::new("mem"), &cancel, None).unwrap(),
            0
        );
    }

    #[test]
    fn test_vec_source_failure_ends_stream() {
        let source = VecSource::new(packets(5)).failing_after(2);
        let items: Vec<Result<PacketRecord>> =
            source.open(Path::new("mem"), &CancelToken::new()).unwrap().collect();
        assert_eq!(items.len(), 3);
        assert!(matches!(items[2], Err(CapflowError::Decoder(_))));
    }

    #[test]
    fn test_vec_source_cancellation() {
        let cancel = CancelToken::new();
        let mut stream = VecSource::new(packets(5)).open(Path::new("mem"), &cancel).unwrap();
        assert!(stream.next().unwrap().is_ok());
        cancel.cancel();
        assert!(matches!(stream.next(), Some(Err(CapflowError::Cancelled))));
        assert!(stream.next().is_none());
    }
}
