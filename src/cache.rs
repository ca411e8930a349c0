//! Time-bounded in-memory cache
//!
//! Entries expire `ttl` after insertion and stop being returned. Expired
//! entries are dropped by [`TtlCache::purge_expired`], which the janitor task
//! runs every `purge_interval`. The store stays the source of truth: callers
//! fall back to it on every miss.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Shared cache with per-entry expiry
#[derive(Clone)]
pub struct TtlCache<K, V> {
    name: &'static str,
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
    ttl: Duration,
    purge_interval: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache
    pub fn new(name: &'static str, ttl: Duration, purge_interval: Duration) -> Self {
        Self {
            name,
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            purge_interval,
        }
    }

    /// Insert or replace an entry, restarting its lifetime
    pub async fn insert(&self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(key, entry);
    }

    /// Get a live entry
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// Remove an entry, returning it if it was still live
    pub async fn remove(&self, key: &K) -> Option<V> {
        let entry = self.entries.write().await.remove(key)?;
        (entry.expires_at > Instant::now()).then_some(entry.value)
    }

    /// Drop every entry whose key fails `keep`
    pub async fn retain_keys<F>(&self, mut keep: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.entries.write().await.retain(|key, _| keep(key));
    }

    /// Drop every expired entry, returning how many were dropped
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Spawn the janitor that purges expired entries until cancelled
    pub fn spawn_janitor(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.purge_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = cache.purge_expired().await;
                        if purged > 0 {
                            debug!("Cache {}: purged {} expired entries", cache.name, purged);
                        }
                    }
                }
            }
        })
    }
}
