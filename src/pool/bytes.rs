//! Power-of-two bucketed byte buffer pool
//!
//! Buckets run from 16 bytes up to a configurable ceiling (1 MiB by
//! default). Requests above the ceiling get a fresh, unpooled buffer.

use std::ops::{Deref, DerefMut};

use serde::Serialize;
use tracing::trace;

use super::{ObjectPool, PoolStats};
use crate::error::{CapflowError, Result};

/// Smallest bucket size
pub const MIN_BUFFER_SIZE: usize = 16;
/// Default largest pooled size
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;
/// Largest ceiling a pool accepts
pub const MAX_POOL_CEILING: usize = 1 << 30;
/// Default idle buffers kept per bucket
pub const DEFAULT_BUFFERS_PER_BUCKET: usize = 32;

/// Per-bucket counters
#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub size: usize,
    #[serde(flatten)]
    pub stats: PoolStats,
}

pub struct ByteBufferPool {
    buckets: Vec<ObjectPool<Vec<u8>>>,
    max_buffer_size: usize,
}

impl Default for ByteBufferPool {
    fn default() -> Self {
        Self::build(DEFAULT_MAX_BUFFER_SIZE, DEFAULT_BUFFERS_PER_BUCKET)
    }
}

impl ByteBufferPool {
    /// Create a pool whose largest bucket is `max_buffer_size` (rounded up to a power of two)
    pub fn new(max_buffer_size: usize, buffers_per_bucket: usize) -> Result<Self> {
        if max_buffer_size < MIN_BUFFER_SIZE {
            return Err(CapflowError::config(format!(
                "max buffer size must be at least {} bytes",
                MIN_BUFFER_SIZE
            )));
        }
        if buffers_per_bucket == 0 {
            return Err(CapflowError::config("buffers per bucket must be greater than zero"));
        }
        match max_buffer_size.checked_next_power_of_two() {
            Some(ceiling) if ceiling <= MAX_POOL_CEILING => Ok(Self::build(ceiling, buffers_per_bucket)),
            _ => Err(CapflowError::config(format!(
                "max buffer size must not exceed {} bytes",
                MAX_POOL_CEILING
            ))),
        }
    }

    /// `ceiling` is a power of two in `MIN_BUFFER_SIZE..=MAX_POOL_CEILING`
    fn build(ceiling: usize, buffers_per_bucket: usize) -> Self {
        let bucket_count = (ceiling.trailing_zeros() - MIN_BUFFER_SIZE.trailing_zeros()) as usize + 1;
        let mut buckets = Vec::with_capacity(bucket_count);
        for idx in 0..bucket_count {
            let bucket_size = MIN_BUFFER_SIZE << idx;
            // Both arguments were validated by the callers
            if let Ok(pool) = ObjectPool::new(buffers_per_bucket, move || vec![0u8; bucket_size]) {
                buckets.push(pool.with_reset(|buf: &mut Vec<u8>| {
                    buf.fill(0);
                    Ok(())
                }));
            }
        }
        Self { buckets, max_buffer_size: ceiling }
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Rent a buffer of at least `min_length` bytes.
    ///
    /// The returned buffer's length is the bucket size, which may exceed
    /// the request. Above the ceiling an exact-size unpooled buffer is returned.
    pub fn rent(&self, min_length: usize) -> Vec<u8> {
        match self.bucket_index(min_length) {
            Some(idx) => self.buckets[idx].rent(),
            None => {
                trace!(min_length, "Buffer request above pool ceiling");
                vec![0u8; min_length]
            }
        }
    }

    /// Rent a buffer that is handed back automatically on drop
    pub fn rent_scoped(&self, min_length: usize) -> PooledBuffer<'_> {
        PooledBuffer { pool: self, buf: Some(self.rent(min_length)) }
    }

    /// Return a buffer. Only exact bucket sizes are re-pooled (zeroed first);
    /// anything else is dropped.
    pub fn release(&self, buf: Vec<u8>) {
        let len = buf.len();
        if len < MIN_BUFFER_SIZE || !len.is_power_of_two() || len > self.max_buffer_size {
            return;
        }
        if let Some(idx) = self.bucket_index(len) {
            self.buckets[idx].release(buf);
        }
    }

    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.clear();
        }
    }

    pub fn stats(&self) -> Vec<BucketStats> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(idx, pool)| BucketStats { size: MIN_BUFFER_SIZE << idx, stats: pool.stats() })
            .collect()
    }

    fn bucket_index(&self, length: usize) -> Option<usize> {
        let size = length.max(MIN_BUFFER_SIZE).checked_next_power_of_two()?;
        if size > self.max_buffer_size {
            return None;
        }
        Some((size.trailing_zeros() - MIN_BUFFER_SIZE.trailing_zeros()) as usize)
    }
}

/// Scoped byte buffer rental
pub struct PooledBuffer<'a> {
    pool: &'a ByteBufferPool,
    buf: Option<Vec<u8>>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
