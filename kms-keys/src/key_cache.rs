//! Short-lived cache of decrypted keys with hit/miss accounting
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::cache::CacheBackend;
use crate::error::{KmsError, KmsResult};
use crate::key_types::DecryptedKey;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default TTL for cached keys
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Upper bound on how long decrypted material may stay cached
pub const MAX_CACHE_TTL_SECS: u64 = 86_400;

const CACHE_PREFIX: &str = "kms:key:";
const HEALTH_PROBE_KEY: &str = "kms:health:check";

/// Cache statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Percentage 0-100, two decimals
    pub hit_rate: f64,
    pub cached_keys: usize,
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    (hits as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// Caches decrypted keys under `kms:key:{tenant_id}:{key_id}`
pub struct KeyCacheManager {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl KeyCacheManager {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_ttl(backend, DEFAULT_CACHE_TTL_SECS)
    }

    /// A TTL of 0 uses the default; TTLs above `MAX_CACHE_TTL_SECS` are clamped.
    pub fn with_ttl(backend: Arc<dyn CacheBackend>, default_ttl_secs: u64) -> Self {
        let default_ttl_secs = match default_ttl_secs {
            0 => DEFAULT_CACHE_TTL_SECS,
            secs if secs > MAX_CACHE_TTL_SECS => {
                warn!(
                    requested = secs,
                    max = MAX_CACHE_TTL_SECS,
                    "Cache TTL too long, clamping"
                );
                MAX_CACHE_TTL_SECS
            }
            secs => secs,
        };
        Self {
            backend,
            default_ttl: Duration::from_secs(default_ttl_secs),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn entry_name(key_id: &str, tenant_id: &str) -> String {
        format!("{}{}:{}", CACHE_PREFIX, tenant_id, key_id)
    }

    fn tenant_pattern(tenant_id: &str) -> String {
        format!("{}{}:*", CACHE_PREFIX, tenant_id)
    }

    fn ttl_or_default(&self, ttl_secs: Option<u64>) -> KmsResult<Duration> {
        match ttl_secs {
            Some(secs) if secs > MAX_CACHE_TTL_SECS => Err(KmsError::Validation(format!(
                "cache TTL must be at most {} seconds, got {}",
                MAX_CACHE_TTL_SECS, secs
            ))),
            Some(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Ok(self.default_ttl),
        }
    }

    /// Cache a decrypted key. `ttl_secs` of `None` or 0 uses the default TTL.
    pub async fn cache_key(&self, key: &DecryptedKey, ttl_secs: Option<u64>) -> KmsResult<()> {
        let ttl = self.ttl_or_default(ttl_secs)?;
        let payload = serde_json::to_string(key)?;
        self.backend
            .set_ex(&Self::entry_name(&key.id, &key.tenant_id), payload, ttl)
            .await
            .map_err(|e| KmsError::Cache(format!("Failed to cache key {}: {}", key.id, e)))?;

        debug!(
            key_id = %key.id,
            tenant_id = %key.tenant_id,
            ttl_secs = ttl.as_secs(),
            "Key cached"
        );
        Ok(())
    }

    /// Look up a cached key. Backend failures are logged and count as a miss.
    pub async fn get_cached_key(&self, key_id: &str, tenant_id: &str) -> Option<DecryptedKey> {
        let cache_key = Self::entry_name(key_id, tenant_id);
        let cached = match self.backend.get(&cache_key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(key_id = %key_id, tenant_id = %tenant_id, error = %e, "Cache read failed");
                None
            }
        };

        let decoded = cached.and_then(|payload| {
            match serde_json::from_str::<DecryptedKey>(&payload) {
                Ok(key) if key.id == key_id && key.tenant_id == tenant_id => Some(key),
                Ok(_) => {
                    warn!(key_id = %key_id, tenant_id = %tenant_id, "Cached entry does not match its key");
                    None
                }
                Err(e) => {
                    warn!(key_id = %key_id, error = %e, "Discarding unreadable cache entry");
                    None
                }
            }
        });

        match decoded {
            Some(key) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key_id = %key_id, "Cache hit");
                Some(key)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key_id = %key_id, "Cache miss");
                None
            }
        }
    }

    pub async fn is_cached(&self, key_id: &str, tenant_id: &str) -> bool {
        match self.backend.exists(&Self::entry_name(key_id, tenant_id)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key_id = %key_id, error = %e, "Cache existence check failed");
                false
            }
        }
    }

    pub async fn invalidate_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<()> {
        self.backend
            .del(&Self::entry_name(key_id, tenant_id))
            .await
            .map_err(|e| KmsError::Cache(format!("Failed to invalidate key {}: {}", key_id, e)))?;
        debug!(key_id = %key_id, tenant_id = %tenant_id, "Cache invalidated");
        Ok(())
    }

    /// Drop every cached key of one tenant, returning how many were removed
    pub async fn invalidate_tenant_keys(&self, tenant_id: &str) -> KmsResult<usize> {
        let removed = self
            .backend
            .del_pattern(&Self::tenant_pattern(tenant_id))
            .await
            .map_err(|e| {
                KmsError::Cache(format!("Failed to invalidate tenant {}: {}", tenant_id, e))
            })?;
        if removed > 0 {
            info!(tenant_id = %tenant_id, count = removed, "Invalidated tenant keys");
        }
        Ok(removed)
    }

    /// Extend a cached key's lifetime. Returns `false` if it is not cached.
    pub async fn refresh_ttl(&self, key_id: &str, tenant_id: &str, ttl_secs: Option<u64>) -> bool {
        let ttl = match self.ttl_or_default(ttl_secs) {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!(key_id = %key_id, error = %e, "Rejected cache TTL refresh");
                return false;
            }
        };
        match self
            .backend
            .expire(&Self::entry_name(key_id, tenant_id), ttl)
            .await
        {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(key_id = %key_id, error = %e, "Failed to refresh cache TTL");
                false
            }
        }
    }

    /// Remove all cached keys
    pub async fn clear_cache(&self) -> KmsResult<usize> {
        let removed = self
            .backend
            .del_pattern(&format!("{}*", CACHE_PREFIX))
            .await
            .map_err(|e| KmsError::Cache(format!("Failed to clear cache: {}", e)))?;
        info!(count = removed, "Key cache cleared");
        Ok(removed)
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let cached_keys = match self.backend.keys(&format!("{}*", CACHE_PREFIX)).await {
            Ok(keys) => keys.len(),
            Err(e) => {
                warn!(error = %e, "Failed to count cached keys");
                0
            }
        };

        CacheStats {
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            cached_keys,
        }
    }

    pub fn reset_cache_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        info!("Cache statistics reset");
    }

    /// Write, read back and delete a marker entry
    pub async fn health_check(&self) -> KmsResult<()> {
        let marker = chrono::Utc::now().timestamp_millis().to_string();
        self.backend
            .set_ex(HEALTH_PROBE_KEY, marker.clone(), Duration::from_secs(10))
            .await?;
        let read_back = self.backend.get(HEALTH_PROBE_KEY).await?;
        self.backend.del(HEALTH_PROBE_KEY).await?;

        if read_back.as_deref() != Some(marker.as_str()) {
            return Err(KmsError::Cache("Health marker read back a different value".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::key_types::{KeyMaterial, KeyPurpose, KeyStatus, DEFAULT_ALGORITHM};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};

    fn key(id: &str, tenant: &str) -> DecryptedKey {
        let now = Utc::now();
        DecryptedKey {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            purpose: KeyPurpose::DocumentEncryption,
            algorithm: DEFAULT_ALGORITHM.to_string(),
            version: 1,
            status: KeyStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: Some(now + ChronoDuration::days(90)),
            key: KeyMaterial::generate(32),
        }
    }

    fn manager() -> KeyCacheManager {
        KeyCacheManager::new(Arc::new(MemoryCache::new()))
    }

    struct BrokenCache;

    #[async_trait]
    impl CacheBackend for BrokenCache {
        async fn set_ex(&self, _: &str, _: String, _: Duration) -> KmsResult<()> {
            Err(KmsError::Cache("connection refused".to_string()))
        }
        async fn get(&self, _: &str) -> KmsResult<Option<String>> {
            Err(KmsError::Cache("connection refused".to_string()))
        }
        async fn del(&self, _: &str) -> KmsResult<bool> {
            Err(KmsError::Cache("connection refused".to_string()))
        }
        async fn del_pattern(&self, _: &str) -> KmsResult<usize> {
            Err(KmsError::Cache("connection refused".to_string()))
        }
        async fn keys(&self, _: &str) -> KmsResult<Vec<String>> {
            Err(KmsError::Cache("connection refused".to_string()))
        }
        async fn exists(&self, _: &str) -> KmsResult<bool> {
            Err(KmsError::Cache("connection refused".to_string()))
        }
        async fn expire(&self, _: &str, _: Duration) -> KmsResult<bool> {
            Err(KmsError::Cache("connection refused".to_string()))
        }
        async fn ping(&self) -> KmsResult<()> {
            Err(KmsError::Cache("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cache_roundtrip_preserves_fields() {
        let cache = manager();
        let original = key("k1", "tenant-a");
        cache.cache_key(&original, None).await.unwrap();

        let cached = cache.get_cached_key("k1", "tenant-a").await.unwrap();
        assert_eq!(cached, original);
        assert_eq!(cached.expires_at, original.expires_at);
        assert_eq!(cached.key.as_bytes(), original.key.as_bytes());
    }

    #[tokio::test]
    async fn test_wrong_tenant_misses() {
        let cache = manager();
        cache.cache_key(&key("k1", "tenant-a"), None).await.unwrap();

        assert!(cache.get_cached_key("k1", "tenant-b").await.is_none());
        assert!(!cache.is_cached("k1", "tenant-b").await);
        assert!(cache.is_cached("k1", "tenant-a").await);
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = manager();
        assert_eq!(cache.get_cache_stats().await.hit_rate, 0.0);

        cache.cache_key(&key("k1", "t"), None).await.unwrap();
        assert!(cache.get_cached_key("k1", "t").await.is_some());
        assert!(cache.get_cached_key("k2", "t").await.is_none());

        let stats = cache.get_cache_stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);
        assert_eq!(stats.cached_keys, 1);

        assert!(cache.get_cached_key("k3", "t").await.is_none());
        assert_eq!(cache.get_cache_stats().await.hit_rate, 33.33);

        cache.reset_cache_stats();
        let stats = cache.get_cache_stats().await;
        assert_eq!((stats.hits, stats.misses, stats.hit_rate), (0, 0, 0.0));
    }

    #[tokio::test]
    async fn test_explicit_ttl_expires() {
        let cache = manager();
        cache.cache_key(&key("k1", "t"), Some(1)).await.unwrap();
        assert!(cache.is_cached("k1", "t").await);

        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        assert!(!cache.is_cached("k1", "t").await);
        assert!(!cache.refresh_ttl("k1", "t", None).await);
    }

    #[tokio::test]
    async fn test_oversized_ttl_rejected() {
        let cache = manager();
        let k = key("k1", "t1");

        let err = cache.cache_key(&k, Some(u64::MAX)).await.unwrap_err();
        assert!(matches!(err, KmsError::Validation(_)));
        assert!(!cache.is_cached("k1", "t1").await);

        cache.cache_key(&k, Some(MAX_CACHE_TTL_SECS)).await.unwrap();
        assert!(!cache.refresh_ttl("k1", "t1", Some(MAX_CACHE_TTL_SECS + 1)).await);
        assert!(cache.refresh_ttl("k1", "t1", Some(60)).await);

        let clamped = KeyCacheManager::with_ttl(Arc::new(MemoryCache::new()), u64::MAX);
        assert_eq!(clamped.default_ttl, Duration::from_secs(MAX_CACHE_TTL_SECS));
        clamped.cache_key(&k, None).await.unwrap();
        assert!(clamped.is_cached("k1", "t1").await);
    }

    #[tokio::test]
    async fn test_invalidation() {
        let cache = manager();
        cache.cache_key(&key("k1", "t1"), None).await.unwrap();
        cache.cache_key(&key("k2", "t1"), None).await.unwrap();
        cache.cache_key(&key("k1", "t2"), None).await.unwrap();

        cache.invalidate_key("k1", "t1").await.unwrap();
        assert!(!cache.is_cached("k1", "t1").await);
        assert!(cache.is_cached("k1", "t2").await);

        assert_eq!(cache.invalidate_tenant_keys("t1").await.unwrap(), 1);
        assert!(!cache.is_cached("k2", "t1").await);
        assert!(cache.is_cached("k1", "t2").await);

        assert!(cache.refresh_ttl("k1", "t2", Some(600)).await);
        assert_eq!(cache.clear_cache().await.unwrap(), 1);
        assert_eq!(cache.get_cache_stats().await.cached_keys, 0);
    }

    #[tokio::test]
    async fn test_backend_failures() {
        let cache = KeyCacheManager::new(Arc::new(BrokenCache));

        assert!(cache.get_cached_key("k1", "t").await.is_none());
        assert_eq!(cache.get_cache_stats().await.misses, 1);
        assert!(!cache.is_cached("k1", "t").await);

        let err = cache.cache_key(&key("k1", "t"), None).await.unwrap_err();
        assert!(matches!(err, KmsError::Cache(_)));
        assert!(cache.invalidate_key("k1", "t").await.is_err());
        assert!(cache.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_health_check_leaves_no_entries() {
        let backend = Arc::new(MemoryCache::new());
        let cache = KeyCacheManager::new(backend.clone());
        cache.health_check().await.unwrap();
        assert!(backend.keys("*").await.unwrap().is_empty());
    }
}
