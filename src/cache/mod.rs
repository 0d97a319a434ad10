//! Keyed TTL caches for the retrieval pipeline.
//!
//! Three cache scopes back the engine, each a deterministic function of
//! its inputs:
//!
//! - **embedding**: text hash → vector (24 h default)
//! - **search**: (normalized query, top_k, profile) → ranked results (1 h)
//! - **response**: (model, query type, prompt hash) → answer text (30 min,
//!   2 h for comprehensive runs)
//!
//! Entries are last-writer-wins; concurrent writers of the same key always
//! write identical values. Cache failures are treated as misses and never
//! surfaced to callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;
use crate::types::RankedResult;

// ============================================================================
// Cache Statistics
// ============================================================================

/// Counters for cache performance monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of live entries.
    pub entry_count: usize,
}

impl CacheStats {
    /// Hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

// ============================================================================
// TTL Cache
// ============================================================================

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// In-memory TTL cache with string keys.
///
/// Thread-safe via `parking_lot::RwLock`; hit/miss counters are relaxed
/// atomics. A disabled cache accepts writes and always misses, so callers
/// never branch on cache availability.
pub struct TtlCache<V: Clone> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache with the given default TTL.
    pub fn new(default_ttl: Duration, enabled: bool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a value, treating expired entries as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }

        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value with the default TTL.
    pub fn insert(&self, key: &str, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Store a value with an explicit TTL.
    pub fn insert_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key.to_string(), entry);
    }

    /// Remove one entry.
    pub fn invalidate(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Remove expired entries. Reads never return expired values; this
    /// just reclaims the memory.
    pub fn purge_expired(&self) {
        let mut entries = self.entries.write();
        entries.retain(|_, entry| !entry.is_expired());
    }

    /// Number of entries, including not-yet-purged expired ones.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.read().len(),
        }
    }
}

/// Compute a stable cache key from parts, SHA-256 hex.
pub fn hash_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Cache Layer
// ============================================================================

/// The engine's cache scopes, built once from configuration. Scopes are
/// individually shared (`Arc`) with the clients that write them.
pub struct CacheLayer {
    /// text hash → embedding vector.
    pub embedding: std::sync::Arc<TtlCache<Vec<f32>>>,
    /// (normalized query, top_k, profile) → ranked results.
    pub search: std::sync::Arc<TtlCache<Vec<RankedResult>>>,
    /// (model, query type, prompt hash) → generated text.
    pub response: std::sync::Arc<TtlCache<String>>,
}

impl CacheLayer {
    /// Build the cache scopes from configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            embedding: std::sync::Arc::new(TtlCache::new(
                Duration::from_secs(config.embedding_ttl_secs),
                config.enabled,
            )),
            search: std::sync::Arc::new(TtlCache::new(
                Duration::from_secs(config.search_ttl_secs),
                config.enabled,
            )),
            response: std::sync::Arc::new(TtlCache::new(
                Duration::from_secs(config.response_ttl_secs),
                config.enabled,
            )),
        }
    }

    /// Drop all entries in every scope.
    pub fn clear(&self) {
        self.embedding.clear();
        self.search.clear();
        self.response.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let cache: TtlCache<Vec<f32>> = TtlCache::new(Duration::from_secs(60), true);

        assert!(cache.get("key").is_none());
        assert_eq!(cache.stats().misses, 1);

        cache.insert("key", vec![1.0, 2.0, 3.0]);
        assert_eq!(cache.get("key").unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60), true);
        cache.insert_with_ttl("key", "value".to_string(), Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(1));
        assert!(cache.get("key").is_none());
    }

    #[test]
    fn test_purge_expired() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60), true);
        cache.insert_with_ttl("stale", "a".to_string(), Duration::from_nanos(1));
        cache.insert("live", "b".to_string());
        std::thread::sleep(Duration::from_millis(1));

        assert_eq!(cache.len(), 2);
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("live").is_some());
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60), false);
        cache.insert("key", "value".to_string());
        assert!(cache.get("key").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), true);
        cache.insert("a", 1);
        cache.insert("b", 2);

        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hash_key_stability() {
        let key1 = hash_key(&["hello world", "bge-m3"]);
        let key2 = hash_key(&["hello world", "bge-m3"]);
        let key3 = hash_key(&["hello world", "other-model"]);
        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_hash_key_separator_matters() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(hash_key(&["ab", "c"]), hash_key(&["a", "bc"]));
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            entry_count: 0,
        };
        assert!((stats.hit_rate() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_layer_from_config() {
        let layer = CacheLayer::new(&CacheConfig::default());
        layer.embedding.insert("k", vec![0.5]);
        assert!(layer.embedding.get("k").is_some());
        layer.clear();
        assert!(layer.embedding.is_empty());
    }
}
