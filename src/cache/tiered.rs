// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier read path: local TTL cache over the KV store's hashes.
//!
//! Entries are keyed `"{hash_key}:{field}"` and the detector sees the hash key
//! (the actor) as the logical key. Only reads of a hot logical key admit into
//! the local tier; writes merely refresh entries that are already there.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tracing::debug;

use crate::hotkey::HotKeyDetector;
use crate::metrics;
use crate::storage::traits::{KvStore, StorageError};

pub struct TieredCache {
    local: Cache<String, String>,
    kv: Arc<dyn KvStore>,
    detector: Arc<HotKeyDetector>,
}

#[inline]
fn composite_key(hash_key: &str, field: &str) -> String {
    format!("{}:{}", hash_key, field)
}

impl TieredCache {
    pub fn new(
        kv: Arc<dyn KvStore>,
        detector: Arc<HotKeyDetector>,
        capacity: u64,
        ttl: Duration,
    ) -> Self {
        let local = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { local, kv, detector }
    }

    /// Local tier first, then the KV store. Every served read counts one access
    /// of `hash_key`; a KV value is admitted locally only if that access is hot.
    pub async fn get(&self, hash_key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let key = composite_key(hash_key, field);

        if let Some(value) = self.local.get(&key) {
            metrics::record_cache_lookup("local", true);
            self.detector.observe(hash_key, 1);
            return Ok(Some(value));
        }
        metrics::record_cache_lookup("local", false);

        let Some(value) = self.kv.hget(hash_key, field).await? else {
            metrics::record_cache_lookup("kv", false);
            return Ok(None);
        };
        metrics::record_cache_lookup("kv", true);

        if self.detector.observe(hash_key, 1).is_hot {
            debug!(key = %key, "Admitting hot entry to local cache");
            self.local.insert(key, value.clone());
        }
        Ok(Some(value))
    }

    /// Local tier only; no access is recorded.
    #[must_use]
    pub fn get_local(&self, hash_key: &str, field: &str) -> Option<String> {
        self.local.get(&composite_key(hash_key, field))
    }

    /// Put into the local tier. Callers must already know the key is hot.
    pub fn admit(&self, hash_key: &str, field: &str, value: &str) {
        self.local.insert(composite_key(hash_key, field), value.to_string());
    }

    /// Refresh an entry only if it is already cached. Returns whether it was.
    pub fn put_if_present(&self, hash_key: &str, field: &str, value: &str) -> bool {
        let key = composite_key(hash_key, field);
        if !self.local.contains_key(&key) {
            return false;
        }
        self.local.insert(key, value.to_string());
        true
    }

    pub fn invalidate(&self, hash_key: &str, field: &str) {
        self.local.invalidate(&composite_key(hash_key, field));
    }

    /// Drop every local entry under a logical key that left the Top-K set.
    pub fn demote(&self, logical_key: &str) -> usize {
        let prefix = format!("{}:", logical_key);
        let stale: Vec<Arc<String>> = self
            .local
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k)
            .collect();
        for key in &stale {
            self.local.invalidate(key.as_str());
        }
        if !stale.is_empty() {
            metrics::record_cache_demotions(stale.len());
        }
        stale.len()
    }

    /// Approximate local entry count (pending maintenance is flushed first).
    #[must_use]
    pub fn local_len(&self) -> u64 {
        self.local.run_pending_tasks();
        self.local.entry_count()
    }

    #[must_use]
    pub fn detector(&self) -> &Arc<HotKeyDetector> {
        &self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotkey::HotKeyConfig;
    use crate::storage::memory::InMemoryKv;

    fn setup(min_count: u32) -> (TieredCache, Arc<InMemoryKv>) {
        let kv = Arc::new(InMemoryKv::new());
        let detector = Arc::new(HotKeyDetector::new(HotKeyConfig {
            k: 4,
            width: 256,
            depth: 3,
            decay: 0.92,
            min_count,
            seed: Some(3),
        }));
        let cache = TieredCache::new(kv.clone(), detector, 100, Duration::from_secs(60));
        (cache, kv)
    }

    #[tokio::test]
    async fn test_cold_key_is_not_admitted() {
        let (cache, kv) = setup(3);
        kv.hset("like:user:1", "10", "m").await.unwrap();

        assert_eq!(cache.get("like:user:1", "10").await.unwrap().as_deref(), Some("m"));
        assert!(cache.get_local("like:user:1", "10").is_none());
    }

    #[tokio::test]
    async fn test_hot_key_is_admitted_and_served_locally() {
        let (cache, kv) = setup(3);
        kv.hset("like:user:1", "10", "m").await.unwrap();

        for _ in 0..3 {
            cache.get("like:user:1", "10").await.unwrap();
        }
        assert_eq!(cache.get_local("like:user:1", "10").as_deref(), Some("m"));

        // local tier answers even after the backing entry is gone
        kv.hdel("like:user:1", "10").await.unwrap();
        assert_eq!(cache.get("like:user:1", "10").await.unwrap().as_deref(), Some("m"));
        assert!(cache.detector().total() >= 4);
    }

    #[tokio::test]
    async fn test_missing_value_is_none() {
        let (cache, _kv) = setup(1);
        assert!(cache.get("like:user:9", "1").await.unwrap().is_none());
        assert_eq!(cache.detector().total(), 0);
    }

    #[test]
    fn test_put_if_present_never_creates() {
        let (cache, _kv) = setup(1);
        assert!(!cache.put_if_present("like:user:1", "10", "m"));
        assert!(cache.get_local("like:user:1", "10").is_none());

        cache.admit("like:user:1", "10", "m");
        assert!(cache.put_if_present("like:user:1", "10", "n"));
        assert_eq!(cache.get_local("like:user:1", "10").as_deref(), Some("n"));
    }

    #[test]
    fn test_demote_matches_whole_logical_key() {
        let (cache, _kv) = setup(1);
        cache.admit("like:user:1", "10", "m");
        cache.admit("like:user:1", "11", "m");
        cache.admit("like:user:12", "10", "m");

        assert_eq!(cache.demote("like:user:1"), 2);
        assert!(cache.get_local("like:user:1", "10").is_none());
        assert!(cache.get_local("like:user:12", "10").is_some());
    }
}
