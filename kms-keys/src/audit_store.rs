//! Append-only storage seam for audit entries
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


use crate::audit::{AuditFilter, AuditLogEntry};
use crate::error::KmsResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Durable home of audit entries. Entries are never modified once appended.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditLogEntry) -> KmsResult<()>;

    /// Matching entries, newest first; equal timestamps return the most
    /// recently appended entry first. `limit: None` returns every match.
    async fn query(&self, filter: &AuditFilter) -> KmsResult<Vec<AuditLogEntry>>;

    /// Remove entries strictly older than `cutoff`, returning the count
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> KmsResult<usize>;
}

/// Audit store kept in process memory, in append order
#[derive(Default)]
pub struct MemoryAuditStore {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, entry: AuditLogEntry) -> KmsResult<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> KmsResult<Vec<AuditLogEntry>> {
        let entries = self.entries.read().await;
        // Reverse append order first so the stable sort keeps newest-appended ahead on ties
        let mut matching: Vec<AuditLogEntry> = entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        drop(entries);

        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let offset = filter.offset.unwrap_or(0);
        Ok(match filter.limit {
            Some(limit) => matching.into_iter().skip(offset).take(limit).collect(),
            None => matching.into_iter().skip(offset).collect(),
        })
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> KmsResult<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.timestamp >= cutoff);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditResult};
    use crate::key_types::Metadata;
    use chrono::Duration;

    fn entry(id: &str, timestamp: DateTime<Utc>) -> AuditLogEntry {
        AuditLogEntry {
            id: id.to_string(),
            timestamp,
            event_type: AuditEventType::KeyAccessed,
            tenant_id: "t".to_string(),
            key_id: Some("k".to_string()),
            service_id: None,
            user_id: None,
            ip_address: None,
            action: "access_key".to_string(),
            result: AuditResult::Success,
            metadata: Metadata::new(),
            hmac_signature: String::new(),
        }
    }

    #[tokio::test]
    async fn test_ties_return_latest_appended_first() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        store.append(entry("a", now)).await.unwrap();
        store.append(entry("b", now)).await.unwrap();
        store.append(entry("c", now - Duration::seconds(5))).await.unwrap();
        store.append(entry("d", now)).await.unwrap();

        let ids: Vec<String> = store
            .query(&AuditFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["d", "b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_delete_before_is_strict() {
        let store = MemoryAuditStore::new();
        let cutoff = Utc::now();
        store.append(entry("old", cutoff - Duration::seconds(1))).await.unwrap();
        store.append(entry("edge", cutoff)).await.unwrap();

        assert_eq!(store.delete_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        assert!(!store.is_empty().await);
    }
}
