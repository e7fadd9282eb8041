use super::cached_data::CacheEntry;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Capacity-bounded key/value store with per-entry TTL and LRU eviction.
///
/// Keys are opaque strings; the cache assigns them no meaning. Every
/// operation, reads included, goes through one exclusive lock because a hit
/// updates the entry's access metadata.
#[derive(Debug)]
pub struct TtlCache<V> {
    inner: Mutex<CacheInner<V>>,
    max_size: usize,
    default_ttl: Duration,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Point-in-time view of one entry, for diagnostics
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: String,
    pub ttl: Duration,
    pub expired: bool,
    pub access_count: u64,
}

impl<V: Clone> TtlCache<V> {
    #[must_use]
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size,
            default_ttl,
        }
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fetch a live value. Expired entries are removed here and count as a
    /// miss.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch();
                let value = entry.value.clone();
                inner.hits += 1;
                debug!("🎯 Cache HIT: {}", key);
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(key);
            debug!("🔄 Cache EXPIRED: {}", key);
        } else {
            debug!("❌ Cache MISS: {}", key);
        }
        inner.misses += 1;
        None
    }

    /// Store `value` with the default TTL.
    pub async fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    /// Store `value` with an explicit TTL.
    ///
    /// Inserting a new key into a full cache first evicts the entry that was
    /// least recently read. Replacing an existing key never evicts.
    pub async fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.lock().await;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_size {
            Self::evict_lru(&mut inner);
        }

        debug!("💾 Cache STORE: {} (TTL: {}ms)", key, ttl.as_millis());
        inner.entries.insert(key, CacheEntry::new(value, ttl));
    }

    fn evict_lru(inner: &mut CacheInner<V>) {
        let oldest_key = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest_key {
            inner.entries.remove(&key);
            inner.evictions += 1;
            debug!("🧹 Cache EVICT (LRU): {}", key);
        }
    }

    /// Remove one key. Returns whether it was present.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.inner.lock().await.entries.remove(key).is_some();
        if removed {
            debug!("🗑️  Cache DELETE: {}", key);
        }
        removed
    }

    /// Remove every key matching `pattern`, where a single `*` matches any
    /// run of characters. Returns the number of entries removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !pattern_matches(pattern, key));
        let removed = before - inner.entries.len();
        drop(inner);

        debug!("🔄 Cache INVALIDATE PATTERN: {} ({} removed)", pattern, removed);
        removed
    }

    /// Drop every expired entry. Returns the number removed.
    pub async fn clean_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - inner.entries.len();
        drop(inner);

        if removed > 0 {
            info!("🧹 Cache sweep removed {} expired entries", removed);
        }
        removed
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        let removed = inner.entries.len();
        inner.entries.clear();
        drop(inner);
        info!("🧹 Cache CLEAR ({} entries)", removed);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    #[allow(clippy::significant_drop_tightening)]
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.entries.len(),
            max_size: self.max_size,
        }
    }

    #[allow(clippy::significant_drop_tightening)]
    pub async fn snapshot(&self) -> Vec<EntrySnapshot> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .map(|(key, entry)| EntrySnapshot {
                key: key.clone(),
                ttl: entry.ttl(),
                expired: entry.is_expired_at(now),
                access_count: entry.access_count,
            })
            .collect()
    }
}

/// Glob match supporting one `*`. Without a `*` the match is exact.
#[must_use]
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == key,
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
}

impl CacheStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_percent(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.size as f64 / self.max_size as f64) * 100.0
        }
    }
}
