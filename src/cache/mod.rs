mod store;

pub use store::{hash_key, InsertOutcome, ENTRY_OVERHEAD};

use crate::config::CacheSettings;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use store::CacheStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shared in-memory response cache.
///
/// One mutex guards the whole store; every operation takes it on entry and
/// drops it before returning, and nothing inside the lock touches the
/// network. Payloads are `Bytes`, so a hit hands back a cheap clone of the
/// stored buffer.
pub struct ResponseCache {
    store: Mutex<CacheStore>,
    default_ttl: Duration,
}

/// Point-in-time counters, in the same shape the upstream pool reports.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejected: u64,
}

impl ResponseCache {
    pub fn new(settings: &CacheSettings) -> Self {
        info!(
            buckets = settings.buckets,
            max_bytes = settings.max_bytes,
            "Response cache created"
        );
        Self {
            store: Mutex::new(CacheStore::new(
                settings.buckets,
                settings.max_bytes,
                settings.max_element_bytes,
            )),
            default_ttl: settings.ttl(),
        }
    }

    /// Fetch a fresh entry, promoting it to most-recently-used. Expired
    /// entries read as misses and are left for the sweeper.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.lock().get(key, Instant::now())
    }

    /// Store a response under the default TTL. A duplicate key is a no-op
    /// while the existing entry is fresh; oversize payloads are turned
    /// away.
    pub fn insert(&self, key: &str, payload: Bytes) -> InsertOutcome {
        self.insert_with_ttl(key, payload, self.default_ttl)
    }

    pub fn insert_with_ttl(&self, key: &str, payload: Bytes, ttl: Duration) -> InsertOutcome {
        self.lock().insert(key, payload, ttl, Instant::now())
    }

    /// Eagerly remove entries past their TTL.
    pub fn sweep_expired(&self) -> usize {
        let removed = self.lock().sweep_expired(Instant::now());
        if removed > 0 {
            debug!(removed, "Sweep removed expired cache entries");
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.lock();
        CacheStats {
            entries: store.entry_count(),
            bytes: store.byte_size(),
            hits: store.hit_count,
            misses: store.miss_count,
            insertions: store.insert_count,
            evictions: store.eviction_count,
            expirations: store.expiration_count,
            rejected: store.rejected_count,
        }
    }

    /// Background task that sweeps expired entries until shutdown.
    pub fn start_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cache.sweep_expired();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheStore> {
        // A poisoned cache mutex means a panic mid-operation; nothing can
        // vouch for the linkage anymore, so treat it as fatal.
        self.store.lock().expect("cache mutex poisoned")
    }
}
