// Memory-mapped random access to capture files
//
// Maps the whole file read-only so arbitrary byte ranges can be read or
// searched without loading the file. The mapping is shared through an
// `Arc` so background chunk readers keep it alive; `close` drops the
// reader's handle exactly once.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use memmap2::Mmap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::common::CancelToken;
use crate::error::{CapflowError, Result};

/// Window size used by `find_pattern`
pub const SEARCH_WINDOW: usize = 64 * 1024;

struct Mapping {
    /// None for zero-length files, which cannot be mapped portably
    mmap: Option<Mmap>,
    _file: File,
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

/// Read-only mapped view of a capture file
pub struct MappedCaptureFile {
    path: PathBuf,
    size: u64,
    mapping: RwLock<Option<Arc<Mapping>>>,
}

impl MappedCaptureFile {
    /// Map `path` read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CapflowError::NotFound(format!("File not found: {}", path.display())));
        }

        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let mmap = if size > 0 {
            // SAFETY: mapped read-only; captures are not expected to be truncated while open
            Some(unsafe { Mmap::map(&file) }?)
        } else {
            None
        };

        debug!(path = %path.display(), size, "Mapped capture file");
        Ok(Self {
            path: path.to_path_buf(),
            size,
            mapping: RwLock::new(Some(Arc::new(Mapping { mmap, _file: file }))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.mapping.read().is_none()
    }

    /// Copy `length` bytes starting at `offset`
    pub fn read_block(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.check_range(offset, length as u64)?;
        let mapping = self.mapping()?;
        let start = offset as usize;
        Ok(mapping.bytes()[start..start + length].to_vec())
    }

    /// Copy up to `count` bytes at `offset` into `buffer[buffer_offset..]`.
    ///
    /// `count` is truncated to the bytes remaining in the file; the number
    /// of bytes copied is returned.
    pub fn read_into(
        &self,
        offset: u64,
        buffer: &mut [u8],
        buffer_offset: usize,
        count: usize,
    ) -> Result<usize> {
        if offset >= self.size {
            return Err(self.range_error(offset, count as u64));
        }
        if buffer_offset.checked_add(count).map_or(true, |end| end > buffer.len()) {
            return Err(CapflowError::OutOfRange {
                offset: buffer_offset as u64,
                length: count as u64,
                size: buffer.len() as u64,
            });
        }

        let available = (self.size - offset) as usize;
        let count = count.min(available);
        let mapping = self.mapping()?;
        let start = offset as usize;
        buffer[buffer_offset..buffer_offset + count]
            .copy_from_slice(&mapping.bytes()[start..start + count]);
        Ok(count)
    }

    /// First absolute offset of `pattern` within `[start, start + length)`.
    ///
    /// Scans in 64 KiB windows that overlap by `pattern.len() - 1` bytes so a
    /// match straddling a window boundary is still found.
    pub fn find_pattern(&self, pattern: &[u8], start: u64, length: u64) -> Result<Option<u64>> {
        if pattern.is_empty() {
            return Err(CapflowError::config("search pattern must not be empty"));
        }
        self.check_range(start, length)?;
        let mapping = self.mapping()?;
        let data = mapping.bytes();

        let end = (start + length) as usize;
        let overlap = pattern.len() - 1;
        let window = SEARCH_WINDOW.max(pattern.len() * 2);
        let mut pos = start as usize;

        while pos + pattern.len() <= end {
            let window_end = (pos + window).min(end);
            if let Some(idx) = find_in(&data[pos..window_end], pattern) {
                return Ok(Some((pos + idx) as u64));
            }
            if window_end == end {
                break;
            }
            pos = window_end - overlap;
        }
        Ok(None)
    }

    /// Stream `[offset, offset + length)` to `callback` in `chunk_size` pieces on a
    /// background thread.
    ///
    /// Cancellation is checked between chunks; the join handle yields the
    /// number of bytes delivered or `Cancelled`. The callback may stop the
    /// stream early by returning false.
    pub fn read_chunks<F>(
        &self,
        offset: u64,
        length: u64,
        chunk_size: usize,
        cancel: CancelToken,
        mut callback: F,
    ) -> Result<JoinHandle<Result<u64>>>
    where
        F: FnMut(u64, &[u8]) -> bool + Send + 'static,
    {
        if chunk_size == 0 {
            return Err(CapflowError::config("chunk size must be greater than zero"));
        }
        self.check_range(offset, length)?;
        let mapping = self.mapping()?;

        let handle = thread::Builder::new()
            .name("capflow-chunk-reader".to_string())
            .spawn(move || {
                let data = mapping.bytes();
                let end = offset + length;
                let mut pos = offset;
                let mut delivered = 0u64;
                while pos < end {
                    cancel.check()?;
                    let chunk_end = (pos + chunk_size as u64).min(end);
                    let chunk = &data[pos as usize..chunk_end as usize];
                    trace!(offset = pos, len = chunk.len(), "Delivering chunk");
                    delivered += chunk.len() as u64;
                    if !callback(pos, chunk) {
                        break;
                    }
                    pos = chunk_end;
                }
                Ok(delivered)
            })?;
        Ok(handle)
    }

    /// Sequential `Read + Seek` view over the mapping.
    ///
    /// The view holds its own reference to the mapping, so it stays valid
    /// after [`close`](Self::close).
    pub fn reader(&self) -> Result<MappedReader> {
        Ok(MappedReader { mapping: self.mapping()?, pos: 0 })
    }

    /// Release the mapping and file handle. Idempotent.
    pub fn close(&self) {
        if self.mapping.write().take().is_some() {
            debug!(path = %self.path.display(), "Closed mapped capture file");
        }
    }

    fn mapping(&self) -> Result<Arc<Mapping>> {
        self.mapping
            .read()
            .clone()
            .ok_or_else(|| CapflowError::Closed(self.path.display().to_string()))
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        let in_range = offset < self.size
            && offset.checked_add(length).map_or(false, |end| end <= self.size);
        if in_range {
            Ok(())
        } else {
            Err(self.range_error(offset, length))
        }
    }

    fn range_error(&self, offset: u64, length: u64) -> CapflowError {
        CapflowError::OutOfRange { offset, length, size: self.size }
    }
}

impl Drop for MappedCaptureFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cursor over a mapped file, see [`MappedCaptureFile::reader`]
pub struct MappedReader {
    mapping: Arc<Mapping>,
    pos: u64,
}

impl Read for MappedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.mapping.bytes();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for MappedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.mapping.bytes().len() as i128;
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::End(delta) => size + i128::from(delta),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of mapping"));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

fn find_in(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    let first = needle[0];
    let last_start = haystack.len() - needle.len();
    let mut i = 0;
    while i <= last_start {
        match haystack[i..=last_start].iter().position(|&b| b == first) {
            Some(p) => {
                let at = i + p;
                if &haystack[at..at + needle.len()] == needle {
                    return Some(at);
                }
                i = at + 1;
            }
            None => return None,
        }
    }
    None
}
