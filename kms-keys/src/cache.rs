//! Cache collaborator seam and an in-memory TTL backend
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


use crate::error::{KmsError, KmsResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Key-value store with per-entry TTL.
///
/// Patterns accept a single trailing `*` (prefix match); anything else is an
/// exact key.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> KmsResult<()>;

    async fn get(&self, key: &str) -> KmsResult<Option<String>>;

    /// Returns `true` when an entry was removed
    async fn del(&self, key: &str) -> KmsResult<bool>;

    /// Remove every entry matching `pattern`, returning the count
    async fn del_pattern(&self, pattern: &str) -> KmsResult<usize>;

    async fn keys(&self, pattern: &str) -> KmsResult<Vec<String>>;

    async fn exists(&self, key: &str) -> KmsResult<bool>;

    /// Reset the TTL of a live entry. Returns `false` when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> KmsResult<bool>;

    async fn ping(&self) -> KmsResult<()>;
}

pub(crate) fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

/// Writes between sweeps of expired entries
const PURGE_EVERY_WRITES: usize = 256;

fn expiry_after(ttl: Duration) -> KmsResult<Instant> {
    Instant::now()
        .checked_add(ttl)
        .ok_or_else(|| KmsError::Cache(format!("TTL of {}s is out of range", ttl.as_secs())))
}

/// Process-local cache. Expired entries are dropped on access and swept
/// every few hundred writes.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    writes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Self::retain_live(&mut entries, now)
    }

    fn retain_live(entries: &mut HashMap<String, (String, Instant)>, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> KmsResult<()> {
        let expires_at = expiry_after(ttl)?;
        let mut entries = self.entries.write().await;
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY_WRITES == PURGE_EVERY_WRITES - 1 {
            let purged = Self::retain_live(&mut entries, Instant::now());
            if purged > 0 {
                debug!(purged, "Purged expired cache entries");
            }
        }
        entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> KmsResult<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // expired
        let mut entries = self.entries.write().await;
        if matches!(entries.get(key), Some((_, expires_at)) if *expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn del(&self, key: &str) -> KmsResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some())
    }

    async fn del_pattern(&self, pattern: &str) -> KmsResult<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !pattern_matches(pattern, key));
        Ok(before - entries.len())
    }

    async fn keys(&self, pattern: &str) -> KmsResult<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, (_, expires_at))| *expires_at > now && pattern_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> KmsResult<bool> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(matches!(entries.get(key), Some((_, expires_at)) if *expires_at > now))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KmsResult<bool> {
        let now = Instant::now();
        let new_expiry = expiry_after(ttl)?;
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some((_, expires_at)) if *expires_at > now => {
                *expires_at = new_expiry;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> KmsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("kms:key:t1:*", "kms:key:t1:abc"));
        assert!(!pattern_matches("kms:key:t1:*", "kms:key:t10:abc"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
        assert!(pattern_matches("*", "anything"));
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let cache = MemoryCache::new();
        cache.set_ex("a", "1".to_string(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), Some("1".to_string()));
        assert!(cache.exists("a").await.unwrap());
        assert!(cache.del("a").await.unwrap());
        assert!(!cache.del("a").await.unwrap());
        assert_eq!(cache.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set_ex("short", "v".to_string(), Duration::from_millis(20)).await.unwrap();
        cache.set_ex("long", "v".to_string(), Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!cache.exists("short").await.unwrap());
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert!(!cache.expire("short", Duration::from_secs(60)).await.unwrap());
        assert_eq!(cache.keys("*").await.unwrap(), vec!["long".to_string()]);
        assert_eq!(cache.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_an_error() {
        let cache = MemoryCache::new();
        let huge = Duration::from_secs(u64::MAX);
        let err = cache.set_ex("a", "1".to_string(), huge).await.unwrap_err();
        assert!(matches!(err, KmsError::Cache(_)));
        assert_eq!(cache.get("a").await.unwrap(), None);

        cache.set_ex("a", "1".to_string(), Duration::from_secs(60)).await.unwrap();
        assert!(cache.expire("a", huge).await.is_err());
        assert_eq!(cache.get("a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_writes_sweep_expired_entries() {
        let cache = MemoryCache::new();
        cache.set_ex("stale", "x".to_string(), Duration::ZERO).await.unwrap();
        for i in 0..PURGE_EVERY_WRITES - 2 {
            cache
                .set_ex(&format!("k{}", i), "x".to_string(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert!(cache.entries.read().await.contains_key("stale"));

        cache.set_ex("last", "x".to_string(), Duration::from_secs(60)).await.unwrap();
        let entries = cache.entries.read().await;
        assert!(!entries.contains_key("stale"));
        assert_eq!(entries.len(), PURGE_EVERY_WRITES - 1);
    }

    #[tokio::test]
    async fn test_del_pattern() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set_ex("kms:key:t1:a", "x".to_string(), ttl).await.unwrap();
        cache.set_ex("kms:key:t1:b", "x".to_string(), ttl).await.unwrap();
        cache.set_ex("kms:key:t2:a", "x".to_string(), ttl).await.unwrap();

        assert_eq!(cache.del_pattern("kms:key:t1:*").await.unwrap(), 2);
        assert_eq!(
            cache.keys("kms:key:*").await.unwrap(),
            vec!["kms:key:t2:a".to_string()]
        );
    }
}
