//! Fixed-count message pools.
//!
//! A pool hands out at most `capacity` envelopes at a time. Allocation either
//! waits for a free envelope or fails immediately, recording the caller site
//! so exhaustion diagnostics name the requester. Freeing happens implicitly
//! when a [`Msg`] drops and always succeeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};
use crate::message::Msg;

/// Counters exposed for diagnostics and invariant tests.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub allocs: AtomicU64,
    pub frees: AtomicU64,
    pub exhaustions: AtomicU64,
}

pub(crate) struct PoolInner {
    name: &'static str,
    capacity: usize,
    free: Mutex<usize>,
    freed: Condvar,
    stats: PoolStats,
    /// Site of the most recent failed allocation.
    last_exhausted_at: Mutex<Option<&'static str>>,
}

/// Shared reference a checked-out message keeps to its home pool.
#[derive(Clone)]
pub(crate) struct PoolRef(Arc<PoolInner>);

impl PoolRef {
    pub(crate) fn name(&self) -> &'static str {
        self.0.name
    }

    pub(crate) fn note_freed(&self) {
        let mut free = self.0.free.lock().unwrap();
        debug_assert!(*free < self.0.capacity, "pool {}: free above capacity", self.0.name);
        *free += 1;
        self.0.stats.frees.fetch_add(1, Ordering::Relaxed);
        self.0.freed.notify_one();
    }
}

/// A fixed-count envelope pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                free: Mutex::new(capacity),
                freed: Condvar::new(),
                stats: PoolStats::default(),
                last_exhausted_at: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Envelopes currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.capacity - *self.inner.free.lock().unwrap()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    /// Allocate an envelope. With `wait` the call blocks until one frees;
    /// without, exhaustion fails fast and records `site`.
    pub fn alloc(&self, site: &'static str, wait: bool) -> Result<Msg> {
        let mut free = self.inner.free.lock().unwrap();
        while *free == 0 {
            if !wait {
                self.inner.stats.exhaustions.fetch_add(1, Ordering::Relaxed);
                *self.inner.last_exhausted_at.lock().unwrap() = Some(site);
                log::warn!(
                    "message pool '{}' exhausted at {site} ({} in flight)",
                    self.inner.name,
                    self.inner.capacity
                );
                return Err(Error::PoolExhausted {
                    pool: self.inner.name,
                    site,
                });
            }
            free = self.inner.freed.wait(free).unwrap();
        }
        *free -= 1;
        self.inner.stats.allocs.fetch_add(1, Ordering::Relaxed);
        drop(free);
        Ok(Msg::new(PoolRef(Arc::clone(&self.inner))))
    }

    /// Site of the most recent failed allocation, if any.
    pub fn last_exhausted_at(&self) -> Option<&'static str> {
        *self.inner.last_exhausted_at.lock().unwrap()
    }
}

/// The three pool kinds the daemon runs with.
#[derive(Clone)]
pub struct PoolSet {
    pub global: Pool,
    pub rt_stats: Pool,
    local_capacity: usize,
}

impl PoolSet {
    pub fn new(global: usize, local: usize, rt_stats: usize) -> Self {
        Self {
            global: Pool::new("global", global),
            rt_stats: Pool::new("rt-stats", rt_stats),
            local_capacity: local,
        }
    }

    /// Create a thread-local pool; freed with the owning thread.
    pub fn new_local(&self) -> Pool {
        Pool::new("local", self.local_capacity)
    }
}

impl Default for PoolSet {
    fn default() -> Self {
        Self::new(128, 32, 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_exactly_once() {
        let pool = Pool::new("p", 4);
        let msgs: Vec<Msg> = (0..4).map(|_| pool.alloc("t", false).unwrap()).collect();
        assert_eq!(pool.in_use(), 4);
        drop(msgs);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.stats().allocs.load(Ordering::Relaxed), 4);
        assert_eq!(pool.stats().frees.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_exhaustion_records_site() {
        let pool = Pool::new("p", 1);
        let _held = pool.alloc("first", false).unwrap();
        let err = pool.alloc("second_site", false).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { site: "second_site", .. }));
        assert_eq!(pool.last_exhausted_at(), Some("second_site"));
        assert_eq!(pool.stats().exhaustions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_waiting_alloc_unblocks_on_free() {
        let pool = Pool::new("p", 1);
        let held = pool.alloc("a", false).unwrap();
        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || pool2.alloc("b", true).map(|_| ()));
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(held);
        waiter.join().unwrap().unwrap();
    }
}
