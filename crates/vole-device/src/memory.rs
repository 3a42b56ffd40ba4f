// Device memory pool — budgeted caching allocator
//
// Device memory is a fixed budget (`DeviceConfig::memory_limit`). Freed
// buffers are not handed back to the system; they go to a free list keyed by
// element count and are reused by the next allocation of the same size.
//
// Budget accounting covers both live and cached bytes. When an allocation
// would exceed the limit the cache is dropped first; only if live buffers
// alone leave no room does the allocation fail with DeviceOutOfMemory. The
// pool never reclaims live buffers on its own, so callers are expected to
// release tensors promptly on the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use vole_core::{Error, Result};

use crate::lock;

/// Snapshot of the pool's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes held by live buffers.
    pub live_bytes: usize,
    /// Bytes held in the free lists.
    pub cached_bytes: usize,
    /// Buffers sitting in the free lists.
    pub cached_buffers: usize,
    /// Allocations served from the free lists.
    pub hits: u64,
    /// Allocations that needed fresh memory.
    pub misses: u64,
    /// The budget.
    pub limit: usize,
}

#[derive(Default)]
struct Accounts {
    live: usize,
    cached: usize,
    buckets: HashMap<usize, Vec<Vec<f32>>>,
}

pub(crate) struct MemoryPool {
    limit: usize,
    accounts: Mutex<Accounts>,
    hits: AtomicU64,
    misses: AtomicU64,
}

const F32_BYTES: usize = std::mem::size_of::<f32>();

impl MemoryPool {
    pub(crate) fn new(limit: usize) -> Self {
        MemoryPool {
            limit,
            accounts: Mutex::new(Accounts::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Allocate `n` slots. Contents are unspecified when served from cache.
    pub(crate) fn alloc(&self, n: usize) -> Result<Vec<f32>> {
        let bytes = n * F32_BYTES;
        let mut acc = lock(&self.accounts);

        if let Some(buf) = acc.buckets.get_mut(&n).and_then(Vec::pop) {
            acc.cached -= bytes;
            acc.live += bytes;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(buf);
        }

        if acc.live + acc.cached + bytes > self.limit && acc.cached > 0 {
            log::debug!(
                "device pool under pressure, dropping {} cached bytes",
                acc.cached
            );
            acc.buckets.clear();
            acc.cached = 0;
        }
        if acc.live + bytes > self.limit {
            return Err(Error::DeviceOutOfMemory {
                requested: bytes,
                available: self.limit - acc.live,
            });
        }
        acc.live += bytes;
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(vec![0.0; n])
    }

    /// Return a buffer to the free lists.
    pub(crate) fn reclaim(&self, buf: Vec<f32>) {
        let bytes = buf.len() * F32_BYTES;
        let mut acc = lock(&self.accounts);
        acc.live = acc.live.saturating_sub(bytes);
        if buf.is_empty() {
            return;
        }
        acc.cached += bytes;
        acc.buckets.entry(buf.len()).or_default().push(buf);
    }

    /// Drop every cached buffer.
    pub(crate) fn empty_cache(&self) {
        let mut acc = lock(&self.accounts);
        acc.buckets.clear();
        acc.cached = 0;
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let acc = lock(&self.accounts);
        PoolStats {
            live_bytes: acc.live,
            cached_bytes: acc.cached,
            cached_buffers: acc.buckets.values().map(Vec::len).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_after_reclaim() {
        let pool = MemoryPool::new(1 << 20);
        let a = pool.alloc(256).unwrap();
        pool.reclaim(a);
        let _b = pool.alloc(256).unwrap();
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.live_bytes, 1024);
        assert_eq!(stats.cached_buffers, 0);
    }

    #[test]
    fn test_budget_exhaustion() {
        let pool = MemoryPool::new(4096);
        let _a = pool.alloc(1000).unwrap();
        let err = pool.alloc(100).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceOutOfMemory {
                requested: 400,
                available: 96
            }
        ));
    }

    #[test]
    fn test_cache_dropped_under_pressure() {
        let pool = MemoryPool::new(4096);
        let a = pool.alloc(1000).unwrap();
        pool.reclaim(a);
        let _b = pool.alloc(900).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.cached_bytes, 0);
        assert_eq!(stats.live_bytes, 3600);
    }
}
