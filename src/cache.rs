//! TTL cache with dogpile protection.
//!
//! On a miss the first caller takes a short-lived per-key lock and
//! recomputes. Everyone else polls for the fresh value with bounded retries
//! and, if the lock is still held when the wait budget runs out, computes
//! directly without touching the cache.

use log::{debug, trace, warn};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub recomputes: u64,
    /// Direct computations after the wait budget ran out.
    pub fallbacks: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct StampedeCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    // key -> (lease start, lease id)
    locks: Mutex<HashMap<K, (Instant, u64)>>,
    next_lease: AtomicU64,
    ttl: Duration,
    lock_timeout: Duration,
    poll_interval: Duration,
    max_retries: u32,
    hits: AtomicU64,
    misses: AtomicU64,
    recomputes: AtomicU64,
    fallbacks: AtomicU64,
}

impl<K, V> StampedeCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            next_lease: AtomicU64::new(0),
            ttl: config.ttl(),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_retries: config.max_poll_retries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            recomputes: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn get_or_compute<E>(&self, key: &K, compute: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(value) = self.fresh(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if let Some(_lock) = self.try_lock(key) {
            // another holder may have stored it between our read and the lock
            if let Some(value) = self.fresh(key) {
                return Ok(value);
            }
            self.recomputes.fetch_add(1, Ordering::Relaxed);
            trace!("cache recompute for {key:?}");
            let value = compute()?;
            self.store(key.clone(), value.clone());
            return Ok(value);
        }

        for _ in 0..self.max_retries {
            std::thread::sleep(self.poll_interval);
            if let Some(value) = self.fresh(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
        }
        warn!("cache lock for {key:?} not released within wait budget, computing directly");
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        compute()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.fresh(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.store(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries past their TTL. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("evicted {removed} expired cache entries");
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            recomputes: self.recomputes.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

    fn fresh(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    fn store(&self, key: K, value: V) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    fn try_lock(&self, key: &K) -> Option<KeyLock<'_, K, V>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((taken, _)) = locks.get(key) {
            if taken.elapsed() < self.lock_timeout {
                return None;
            }
            warn!("cache lock for {key:?} outlived its lease, taking over");
        }
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        locks.insert(key.clone(), (Instant::now(), lease));
        Some(KeyLock {
            cache: self,
            key: key.clone(),
            lease,
        })
    }
}

/// Releases the per-key recompute lock on drop, including on error. A holder
/// whose lease was taken over leaves the new holder's lock in place.
struct KeyLock<'a, K, V>
where
    K: Eq + Hash,
{
    cache: &'a StampedeCache<K, V>,
    key: K,
    lease: u64,
}

impl<K, V> Drop for KeyLock<'_, K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut locks = self.cache.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks.get(&self.key).is_some_and(|(_, lease)| *lease == self.lease) {
            locks.remove(&self.key);
        }
    }
}
