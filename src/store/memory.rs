//! In-memory store with store-wide expiry and a memory cap.
//!
//! Provides a thread-safe key-value map with:
//! - A single TTL applied to every item at write time
//! - Approximate memory accounting and capping
//! - Least-recently-used eviction when the cap is reached
//! - The store-wide lock required by the [`Store`] contract

use super::{Status, Store, StoreLock};
use crate::metrics::Metrics;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Settings for [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum memory usage in bytes.
    pub max_memory: usize,
    /// TTL in seconds applied to every item (0 = never expire).
    pub ttl: u64,
    /// Seconds between background expiry sweeps.
    pub cleanup_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024,
            ttl: 0,
            cleanup_interval: 60,
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
    /// Access sequence number for LRU eviction
    last_access: AtomicU64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Approximate footprint of one item.
fn entry_size(key_len: usize, value_len: usize) -> usize {
    std::mem::size_of::<Entry>() + key_len + value_len
}

/// Storage statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub item_count: usize,
    pub memory_used: usize,
    pub max_memory: usize,
}

pub struct MemoryStore {
    data: RwLock<HashMap<Bytes, Entry>>,
    /// Only modified while holding the `data` write lock
    memory_used: AtomicU64,
    max_memory: usize,
    ttl: Option<Duration>,
    access_counter: AtomicU64,
    store_lock: Mutex<()>,
    metrics: Arc<dyn Metrics>,
}

impl MemoryStore {
    pub fn new(config: &StoreConfig, metrics: Arc<dyn Metrics>) -> Arc<Self> {
        info!(
            max_memory_mb = config.max_memory / 1024 / 1024,
            ttl = config.ttl,
            "Initializing storage"
        );
        Arc::new(Self {
            data: RwLock::new(HashMap::new()),
            memory_used: AtomicU64::new(0),
            max_memory: config.max_memory,
            ttl: (config.ttl > 0).then(|| Duration::from_secs(config.ttl)),
            access_counter: AtomicU64::new(0),
            store_lock: Mutex::new(()),
            metrics,
        })
    }

    /// Publish item count and memory usage gauges once per metrics epoch.
    pub fn register_gauges(self: &Arc<Self>) {
        let store = Arc::downgrade(self);
        self.metrics.on_epoch(Box::new(move || {
            if let Some(store) = store.upgrade() {
                let stats = store.stats();
                store.metrics.gauge("store.items", stats.item_count as u64);
                store.metrics.gauge("store.bytes", stats.memory_used as u64);
            }
        }));
    }

    /// Sweep expired items every `interval`, forever.
    pub async fn run_cleanup(self: Arc<Self>, interval: Duration) {
        let mut interval = tokio::time::interval(interval);
        loop {
            interval.tick().await;
            let count = self.cleanup_expired();
            if count > 0 {
                debug!(count, "Cleaned up expired items");
            }
        }
    }

    /// Remove all expired items, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.write_data();
        let before = data.len();
        let mut freed = 0;
        data.retain(|key, entry| {
            if entry.is_expired(now) {
                freed += entry_size(key.len(), entry.value.len());
                false
            } else {
                true
            }
        });
        self.memory_used.fetch_sub(freed as u64, Ordering::SeqCst);
        before - data.len()
    }

    pub fn stats(&self) -> StoreStats {
        let data = self.read_data();
        StoreStats {
            item_count: data.len(),
            memory_used: self.memory_used.load(Ordering::SeqCst) as usize,
            max_memory: self.max_memory,
        }
    }

    fn next_access(&self) -> u64 {
        self.access_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn read_data(&self) -> RwLockReadGuard<'_, HashMap<Bytes, Entry>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_data(&self) -> RwLockWriteGuard<'_, HashMap<Bytes, Entry>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_locked(&self, data: &mut HashMap<Bytes, Entry>, key: &[u8]) -> bool {
        match data.remove(key) {
            Some(entry) => {
                let size = entry_size(key.len(), entry.value.len());
                self.memory_used.fetch_sub(size as u64, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Evict least recently used items until `needed` more bytes fit.
    fn make_room(&self, data: &mut HashMap<Bytes, Entry>, needed: usize) {
        while self.memory_used.load(Ordering::SeqCst) as usize + needed > self.max_memory {
            let lru_key = data
                .iter()
                .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone());

            match lru_key {
                Some(key) => {
                    debug!(key = ?key, "Evicting LRU item");
                    self.remove_locked(data, &key);
                    self.metrics.counter("store.evictions", 1);
                }
                None => break,
            }
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Status<Bytes> {
        let now = Instant::now();
        {
            let data = self.read_data();
            match data.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.last_access.store(self.next_access(), Ordering::Relaxed);
                    self.metrics.counter("store.get.success", 1);
                    return Status::Ok(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.metrics.counter("store.get.not_found", 1);
                    return Status::NotFound;
                }
            }
        }

        // Expired: drop it unless someone rewrote it in the meantime
        let mut data = self.write_data();
        if data.get(key).is_some_and(|entry| entry.is_expired(now)) {
            trace!(key = ?key, "Item expired on access");
            self.remove_locked(&mut data, key);
        }
        self.metrics.counter("store.get.not_found", 1);
        Status::NotFound
    }

    fn put(&self, key: &[u8], value: Bytes) -> Status {
        let size = entry_size(key.len(), value.len());
        if size > self.max_memory {
            self.metrics.counter("store.put.error", 1);
            return Status::Error("value exceeds store capacity".to_string());
        }

        let entry = Entry {
            value,
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
            last_access: AtomicU64::new(self.next_access()),
        };

        let mut data = self.write_data();
        self.remove_locked(&mut data, key);
        self.make_room(&mut data, size);
        data.insert(Bytes::copy_from_slice(key), entry);
        self.memory_used.fetch_add(size as u64, Ordering::SeqCst);

        trace!(
            key = ?key,
            memory_used = self.memory_used.load(Ordering::SeqCst),
            "Item stored"
        );
        self.metrics.counter("store.put.success", 1);
        Status::OK
    }

    fn delete(&self, key: &[u8]) -> Status {
        let mut data = self.write_data();
        let now = Instant::now();
        let live = data.get(key).is_some_and(|entry| !entry.is_expired(now));
        let removed = self.remove_locked(&mut data, key);

        if removed && live {
            trace!(key = ?key, "Item deleted");
            self.metrics.counter("store.delete.success", 1);
            Status::OK
        } else {
            self.metrics.counter("store.delete.not_found", 1);
            Status::NotFound
        }
    }

    fn lock(&self) -> StoreLock<'_> {
        StoreLock::new(self.store_lock.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
