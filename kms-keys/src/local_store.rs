//! Reference key storage: in-memory index with optional JSON write-through
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


use crate::crypto::WrappedKey;
use crate::error::{KmsError, KmsResult};
use crate::key_types::{
    EncryptedKeyData, KeyFilter, KeyId, KeyPurpose, KeyStatus, Metadata, StatusCounts, TenantId,
};
use crate::storage::{KeyStorage, StatusUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type RecordIndex = HashMap<(TenantId, KeyId), EncryptedKeyData>;

/// Key storage backed by a process-local index.
///
/// When opened on a directory every record is also written to
/// `<root>/<tenant_id>/<key_id>.json` and reloaded on the next open. Records
/// only ever contain wrapped key material.
pub struct LocalKeyStorage {
    /// Storage directory, `None` for memory-only
    storage_path: Option<PathBuf>,
    records: RwLock<RecordIndex>,
}

impl LocalKeyStorage {
    /// Memory-only storage
    pub fn ephemeral() -> Self {
        Self {
            storage_path: None,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) a storage directory and load existing records
    pub async fn open<P: AsRef<Path>>(storage_path: P) -> KmsResult<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        fs::create_dir_all(&storage_path).await?;

        let store = Self {
            storage_path: Some(storage_path),
            records: RwLock::new(HashMap::new()),
        };
        store.load_records().await?;
        Ok(store)
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.as_deref()
    }

    fn record_path(&self, tenant_id: &str, key_id: &str) -> Option<PathBuf> {
        self.storage_path
            .as_ref()
            .map(|root| root.join(tenant_id).join(format!("{}.json", key_id)))
    }

    async fn load_records(&self) -> KmsResult<()> {
        let Some(root) = self.storage_path.as_ref() else {
            return Ok(());
        };

        let mut records = self.records.write().await;
        records.clear();

        let mut tenants = fs::read_dir(root).await?;
        while let Some(tenant_dir) = tenants.next_entry().await? {
            if !tenant_dir.file_type().await?.is_dir() {
                continue;
            }
            let tenant_name = tenant_dir.file_name().to_string_lossy().into_owned();

            let mut files = fs::read_dir(tenant_dir.path()).await?;
            while let Some(entry) = files.next_entry().await? {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "json") {
                    continue;
                }
                let content = match fs::read_to_string(&path).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to read key record");
                        continue;
                    }
                };
                match serde_json::from_str::<EncryptedKeyData>(&content) {
                    Ok(record) if record.tenant_id == tenant_name => {
                        records.insert((record.tenant_id.clone(), record.id.clone()), record);
                    }
                    Ok(record) => {
                        warn!(
                            path = %path.display(),
                            tenant_id = %record.tenant_id,
                            "Key record stored under the wrong tenant directory, skipping"
                        );
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to parse key record");
                    }
                }
            }
        }

        info!(count = records.len(), "Loaded key records");
        Ok(())
    }

    async fn persist(&self, record: &EncryptedKeyData) -> KmsResult<()> {
        if let Some(path) = self.record_path(&record.tenant_id, &record.id) {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).await?;
            }
            let json = serde_json::to_string_pretty(record)?;
            fs::write(&path, json).await?;
        }
        Ok(())
    }

    /// Apply `change` to a copy of the record, persist it, then publish it
    async fn update_with<F>(
        &self,
        key_id: &str,
        tenant_id: &str,
        change: F,
    ) -> KmsResult<Option<EncryptedKeyData>>
    where
        F: FnOnce(&mut EncryptedKeyData) + Send,
    {
        let mut records = self.records.write().await;
        let index = (tenant_id.to_string(), key_id.to_string());
        let Some(current) = records.get(&index) else {
            return Ok(None);
        };

        let mut updated = current.clone();
        change(&mut updated);
        self.persist(&updated).await?;
        records.insert(index, updated.clone());
        Ok(Some(updated))
    }
}

#[async_trait]
impl KeyStorage for LocalKeyStorage {
    async fn save_key(&self, record: &EncryptedKeyData) -> KmsResult<()> {
        let mut records = self.records.write().await;
        self.persist(record).await?;
        records.insert(
            (record.tenant_id.clone(), record.id.clone()),
            record.clone(),
        );

        debug!(
            key_id = %record.id,
            tenant_id = %record.tenant_id,
            version = record.version,
            "Key record saved"
        );
        Ok(())
    }

    async fn insert_next_version(&self, mut record: EncryptedKeyData) -> KmsResult<EncryptedKeyData> {
        let mut records = self.records.write().await;
        record.version = records
            .values()
            .filter(|r| r.tenant_id == record.tenant_id && r.purpose == record.purpose)
            .map(|r| r.version)
            .max()
            .unwrap_or(0)
            + 1;
        self.persist(&record).await?;
        records.insert(
            (record.tenant_id.clone(), record.id.clone()),
            record.clone(),
        );

        debug!(
            key_id = %record.id,
            tenant_id = %record.tenant_id,
            version = record.version,
            "Key record inserted"
        );
        Ok(record)
    }

    async fn get_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<Option<EncryptedKeyData>> {
        let records = self.records.read().await;
        Ok(records
            .get(&(tenant_id.to_string(), key_id.to_string()))
            .cloned())
    }

    async fn get_latest_key_for_purpose(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
    ) -> KmsResult<Option<EncryptedKeyData>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| {
                r.tenant_id == tenant_id && r.purpose == purpose && r.status == KeyStatus::Active
            })
            .max_by_key(|r| (r.version, r.created_at))
            .cloned())
    }

    async fn update_key_status(
        &self,
        key_id: &str,
        tenant_id: &str,
        status: KeyStatus,
    ) -> KmsResult<bool> {
        let updated = self
            .update_with(key_id, tenant_id, |record| {
                record.status = status;
                record.updated_at = Utc::now();
            })
            .await?;
        Ok(updated.is_some())
    }

    async fn transition_key_status(
        &self,
        key_id: &str,
        tenant_id: &str,
        expected: KeyStatus,
        new_status: KeyStatus,
    ) -> KmsResult<StatusUpdate> {
        let mut records = self.records.write().await;
        let index = (tenant_id.to_string(), key_id.to_string());
        let Some(current) = records.get(&index) else {
            return Ok(StatusUpdate::NotFound);
        };
        if current.status != expected {
            return Ok(StatusUpdate::Conflict(current.status));
        }

        let mut updated = current.clone();
        updated.status = new_status;
        updated.updated_at = Utc::now();
        self.persist(&updated).await?;
        records.insert(index, updated.clone());
        Ok(StatusUpdate::Updated(updated))
    }

    async fn update_last_used(&self, key_id: &str, tenant_id: &str) -> KmsResult<bool> {
        let updated = self
            .update_with(key_id, tenant_id, |record| {
                record.last_used_at = Some(Utc::now());
            })
            .await?;
        Ok(updated.is_some())
    }

    async fn update_key_metadata(
        &self,
        key_id: &str,
        tenant_id: &str,
        expires_at: Option<DateTime<Utc>>,
        metadata: Metadata,
    ) -> KmsResult<bool> {
        let updated = self
            .update_with(key_id, tenant_id, move |record| {
                record.expires_at = expires_at;
                record.metadata = metadata;
                record.updated_at = Utc::now();
            })
            .await?;
        Ok(updated.is_some())
    }

    async fn update_wrapped_key(
        &self,
        key_id: &str,
        tenant_id: &str,
        wrapped: &WrappedKey,
    ) -> KmsResult<bool> {
        let wrapped = wrapped.clone();
        let updated = self
            .update_with(key_id, tenant_id, move |record| {
                record.encrypted_key = wrapped.encrypted_key;
                record.iv = wrapped.iv;
                record.auth_tag = wrapped.auth_tag;
                record.updated_at = Utc::now();
            })
            .await?;
        Ok(updated.is_some())
    }

    async fn list_keys(
        &self,
        tenant_id: &str,
        filter: &KeyFilter,
    ) -> KmsResult<Vec<EncryptedKeyData>> {
        let records = self.records.read().await;
        let mut matching: Vec<EncryptedKeyData> = records
            .values()
            .filter(|r| r.tenant_id == tenant_id && filter.matches(r))
            .cloned()
            .collect();
        drop(records);

        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.version.cmp(&a.version))
        });
        Ok(matching
            .into_iter()
            .skip(filter.offset())
            .take(filter.limit())
            .collect())
    }

    async fn delete_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<bool> {
        let mut records = self.records.write().await;
        let index = (tenant_id.to_string(), key_id.to_string());
        if !records.contains_key(&index) {
            return Ok(false);
        }

        if let Some(path) = self.record_path(tenant_id, key_id) {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(KmsError::Io(e)),
            }
        }
        records.remove(&index);

        info!(key_id = %key_id, tenant_id = %tenant_id, "Key record deleted");
        Ok(true)
    }

    async fn count_keys_by_status(&self, tenant_id: &str) -> KmsResult<StatusCounts> {
        let records = self.records.read().await;
        let mut counts = StatusCounts::default();
        for record in records.values().filter(|r| r.tenant_id == tenant_id) {
            counts.increment(record.status);
        }
        Ok(counts)
    }

    async fn find_expired_keys(
        &self,
        tenant_id: Option<&str>,
    ) -> KmsResult<Vec<EncryptedKeyData>> {
        let now = Utc::now();
        let records = self.records.read().await;
        let mut expired: Vec<EncryptedKeyData> = records
            .values()
            .filter(|r| tenant_id.map_or(true, |t| r.tenant_id == t))
            .filter(|r| r.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired)
    }

    async fn max_version(&self, tenant_id: &str, purpose: KeyPurpose) -> KmsResult<u32> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.purpose == purpose)
            .map(|r| r.version)
            .max()
            .unwrap_or(0))
    }

    async fn ping(&self) -> KmsResult<()> {
        if let Some(root) = self.storage_path.as_ref() {
            let meta = fs::metadata(root).await.map_err(|e| {
                KmsError::Storage(format!("Storage directory unavailable: {}", e))
            })?;
            if !meta.is_dir() {
                return Err(KmsError::Storage(format!(
                    "Storage path is not a directory: {}",
                    root.display()
                )));
            }
        }
        Ok(())
    }
}
