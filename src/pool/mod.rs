// Reusable object pool
//
// Cuts allocation pressure during high-throughput parsing. The resident set
// is a lock-free bounded queue, so the pool can never retain more than its
// configured maximum; surplus returns are dropped (which runs `Drop` for
// types with a disposal contract).

pub mod bytes;

use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use tracing::{trace, warn};

use crate::error::{CapflowError, Result};

pub use bytes::ByteBufferPool;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) -> std::result::Result<(), String> + Send + Sync>;

/// Read-only snapshot of pool counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub rented: u64,
    pub returned: u64,
    pub discarded: u64,
    /// Objects currently sitting in the pool
    pub resident: usize,
    pub max_retained: usize,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    rented: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

/// Bounded pool of reusable objects
pub struct ObjectPool<T> {
    items: ArrayQueue<T>,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
    counters: PoolCounters,
}

impl<T: Send> ObjectPool<T> {
    /// Create a pool retaining at most `max_retained` idle objects
    pub fn new<F>(max_retained: usize, factory: F) -> Result<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        if max_retained == 0 {
            return Err(CapflowError::config("pool size must be greater than zero"));
        }
        Ok(Self {
            items: ArrayQueue::new(max_retained),
            factory: Box::new(factory),
            reset: None,
            counters: PoolCounters::default(),
        })
    }

    /// Reset applied to every returned object before it is re-pooled.
    /// A failing (or panicking) reset discards the object instead.
    pub fn with_reset<R>(mut self, reset: R) -> Self
    where
        R: Fn(&mut T) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.reset = Some(Box::new(reset));
        self
    }

    /// Take an object from the pool, creating one if the pool is empty
    pub fn rent(&self) -> T {
        self.counters.rented.fetch_add(1, Ordering::Relaxed);
        match self.items.pop() {
            Some(item) => item,
            None => {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        }
    }

    /// Rent an object that returns itself when the guard is dropped
    pub fn rent_scoped(&self) -> Pooled<'_, T> {
        Pooled { pool: self, value: Some(self.rent()) }
    }

    /// Return an object to the pool
    pub fn release(&self, mut item: T) {
        self.counters.returned.fetch_add(1, Ordering::Relaxed);

        if let Some(reset) = &self.reset {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| reset(&mut item)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(msg)) => Some(msg),
                Err(_) => Some("reset panicked".to_string()),
            };
            if let Some(msg) = failure {
                warn!(error = %msg, "Pool reset failed, discarding object");
                self.discard(item);
                return;
            }
        }

        if let Err(item) = self.items.push(item) {
            trace!("Pool full, discarding returned object");
            self.discard(item);
        }
    }

    /// Drop every idle object
    pub fn clear(&self) {
        while let Some(item) = self.items.pop() {
            self.discard(item);
        }
    }

    pub fn resident(&self) -> usize {
        self.items.len()
    }

    pub fn max_retained(&self) -> usize {
        self.items.capacity()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.counters.created.load(Ordering::Relaxed),
            rented: self.counters.rented.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            resident: self.items.len(),
            max_retained: self.items.capacity(),
        }
    }

    fn discard(&self, item: T) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        drop(item);
    }
}

/// Scoped rental; the object goes back to its pool exactly once, on drop
pub struct Pooled<'a, T: Send> {
    pool: &'a ObjectPool<T>,
    value: Option<T>,
}

impl<T: Send> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the value
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T: Send> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T: Send> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_zero_size_rejected() {
        assert!(ObjectPool::new(0, Vec::<u8>::new).is_err());
    }

    #[test]
    fn test_rent_reuses_returned_object() {
        let pool = ObjectPool::new(4, || Vec::<u32>::with_capacity(16)).unwrap();
        let mut v = pool.rent();
        v.push(1);
        pool.release(v);
        assert_eq!(pool.resident(), 1);

        let reused = pool.rent();
        assert_eq!(reused, vec![1]);
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.rented, 2);
        assert_eq!(stats.returned, 1);
    }

    #[test]
    fn test_resident_never_exceeds_max() {
        let pool = ObjectPool::new(3, String::new).unwrap();
        let rented: Vec<String> = (0..10).map(|_| pool.rent()).collect();
        for s in rented {
            pool.release(s);
            assert!(pool.resident() <= 3);
        }
        let stats = pool.stats();
        assert_eq!(stats.resident, 3);
        assert_eq!(stats.discarded, 7);
        assert_eq!(stats.created, 10);
    }

    #[test]
    fn test_reset_is_applied() {
        let pool = ObjectPool::new(2, Vec::<u8>::new)
            .unwrap()
            .with_reset(|v| {
                v.clear();
                Ok(())
            });
        let mut v = pool.rent();
        v.extend_from_slice(b"abc");
        pool.release(v);
        assert!(pool.rent().is_empty());
    }

    #[test]
    fn test_failing_reset_discards() {
        let pool = ObjectPool::new(2, || 0u32)
            .unwrap()
            .with_reset(|v| if *v > 5 { Err("too big".into()) } else { Ok(()) });
        pool.release(9);
        pool.release(1);
        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.resident, 1);
    }

    #[test]
    fn test_panicking_reset_discards() {
        let pool = ObjectPool::new(2, || 0u32)
            .unwrap()
            .with_reset(|_| panic!("reset blew up"));
        pool.release(1);
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.resident(), 0);
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_discard_runs_disposal() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposed);
        let pool = ObjectPool::new(1, move || Tracked(Arc::clone(&counter))).unwrap();
        let a = pool.rent();
        let b = pool.rent();
        pool.release(a);
        pool.release(b);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        pool.clear();
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    fn fails_early(pool: &ObjectPool<Vec<u8>>) -> std::result::Result<(), String> {
        let mut buf = pool.rent_scoped();
        buf.push(1);
        Err("early exit".to_string())
    }

    #[test]
    fn test_scoped_rental_returns_on_early_exit() {
        let pool = ObjectPool::new(2, Vec::<u8>::new).unwrap();
        assert!(fails_early(&pool).is_err());
        assert_eq!(pool.resident(), 1);
        assert_eq!(pool.stats().returned, 1);

        {
            let _a = pool.rent_scoped();
            let _b = pool.rent_scoped();
        }
        assert_eq!(pool.resident(), 2);
        assert_eq!(pool.stats().returned, 3);
    }
}
