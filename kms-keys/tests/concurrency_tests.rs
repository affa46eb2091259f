//! Concurrent access to a single key management service
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


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kms_keys::crypto::WrappedKey;
use kms_keys::{
    AuditLogger, CreateKeyOptions, EncryptedKeyData, KeyCacheManager, KeyFilter,
    KeyManagementService, KeyPurpose, KeyRotationManager, KeyStatus, KeyStorage, KmsError,
    KmsResult, LocalKeyStorage, MasterKeyManager, MemoryAuditStore, MemoryCache,
    MemoryScheduleStore, Metadata, StatusCounts, StatusUpdate,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const MASTER: &str = "9a8b7c6d5e4f30211203f4e5d6c7b8a99a8b7c6d5e4f30211203f4e5d6c7b8a9";

/// Storage that can hold one `get_key` call after it has read the record,
/// until the test releases it
struct GatedStorage {
    inner: LocalKeyStorage,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl GatedStorage {
    fn new() -> Self {
        Self {
            inner: LocalKeyStorage::ephemeral(),
            armed: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyStorage for GatedStorage {
    async fn save_key(&self, record: &EncryptedKeyData) -> KmsResult<()> {
        self.inner.save_key(record).await
    }

    async fn insert_next_version(&self, record: EncryptedKeyData) -> KmsResult<EncryptedKeyData> {
        self.inner.insert_next_version(record).await
    }

    async fn get_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<Option<EncryptedKeyData>> {
        let record = self.inner.get_key(key_id, tenant_id).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        Ok(record)
    }

    async fn get_latest_key_for_purpose(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
    ) -> KmsResult<Option<EncryptedKeyData>> {
        self.inner.get_latest_key_for_purpose(tenant_id, purpose).await
    }

    async fn update_key_status(&self, key_id: &str, tenant_id: &str, status: KeyStatus) -> KmsResult<bool> {
        self.inner.update_key_status(key_id, tenant_id, status).await
    }

    async fn transition_key_status(
        &self,
        key_id: &str,
        tenant_id: &str,
        expected: KeyStatus,
        new_status: KeyStatus,
    ) -> KmsResult<StatusUpdate> {
        self.inner
            .transition_key_status(key_id, tenant_id, expected, new_status)
            .await
    }

    async fn update_last_used(&self, key_id: &str, tenant_id: &str) -> KmsResult<bool> {
        self.inner.update_last_used(key_id, tenant_id).await
    }

    async fn update_key_metadata(
        &self,
        key_id: &str,
        tenant_id: &str,
        expires_at: Option<DateTime<Utc>>,
        metadata: Metadata,
    ) -> KmsResult<bool> {
        self.inner
            .update_key_metadata(key_id, tenant_id, expires_at, metadata)
            .await
    }

    async fn update_wrapped_key(&self, key_id: &str, tenant_id: &str, wrapped: &WrappedKey) -> KmsResult<bool> {
        self.inner.update_wrapped_key(key_id, tenant_id, wrapped).await
    }

    async fn list_keys(&self, tenant_id: &str, filter: &KeyFilter) -> KmsResult<Vec<EncryptedKeyData>> {
        self.inner.list_keys(tenant_id, filter).await
    }

    async fn delete_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<bool> {
        self.inner.delete_key(key_id, tenant_id).await
    }

    async fn count_keys_by_status(&self, tenant_id: &str) -> KmsResult<StatusCounts> {
        self.inner.count_keys_by_status(tenant_id).await
    }

    async fn find_expired_keys(&self, tenant_id: Option<&str>) -> KmsResult<Vec<EncryptedKeyData>> {
        self.inner.find_expired_keys(tenant_id).await
    }

    async fn max_version(&self, tenant_id: &str, purpose: KeyPurpose) -> KmsResult<u32> {
        self.inner.max_version(tenant_id, purpose).await
    }

    async fn ping(&self) -> KmsResult<()> {
        self.inner.ping().await
    }
}

fn service_over(storage: Arc<GatedStorage>) -> Arc<KeyManagementService> {
    let storage: Arc<dyn KeyStorage> = storage;
    let rotation = KeyRotationManager::new(storage.clone(), Arc::new(MemoryScheduleStore::new()));
    Arc::new(KeyManagementService::new(
        Arc::new(MasterKeyManager::from_hex(MASTER).unwrap()),
        storage,
        KeyCacheManager::new(Arc::new(MemoryCache::new())),
        AuditLogger::new(Arc::new(MemoryAuditStore::new()), Some("concurrency-audit-key")),
        rotation,
    ))
}

fn in_memory() -> Arc<KeyManagementService> {
    Arc::new(KeyManagementService::in_memory(
        Arc::new(MasterKeyManager::from_hex(MASTER).unwrap()),
        Some("concurrency-audit-key"),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disable_during_cache_fill_leaves_no_stale_entry() {
    let storage = Arc::new(GatedStorage::new());
    let kms = service_over(storage.clone());
    let created = kms
        .create_key(CreateKeyOptions::new("acme", KeyPurpose::DataEncryption))
        .await
        .unwrap();
    assert!(!kms.cache().is_cached(&created.id, "acme").await);

    // reader loads the ACTIVE record, then stalls before caching it
    storage.arm();
    let reader = {
        let kms = kms.clone();
        let key_id = created.id.clone();
        tokio::spawn(async move { kms.get_key(&key_id, "acme", None).await })
    };
    storage.reached.notified().await;

    let disabler = {
        let kms = kms.clone();
        let key_id = created.id.clone();
        tokio::spawn(async move { kms.deactivate_key(&key_id, "acme").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!disabler.is_finished(), "status change must wait for the in-flight read");

    storage.release.notify_one();
    let read = reader.await.unwrap();
    assert_eq!(read.unwrap().status, KeyStatus::Active);
    let disabled = disabler.await.unwrap().unwrap();
    assert_eq!(disabled.status, KeyStatus::Disabled);

    assert!(!kms.cache().is_cached(&created.id, "acme").await);
    let err = kms.get_key(&created.id, "acme", None).await.unwrap_err();
    assert!(matches!(err, KmsError::KeyDisabled(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_get_distinct_versions() {
    let kms = in_memory();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let kms = kms.clone();
        handles.push(tokio::spawn(async move {
            kms.create_key(CreateKeyOptions::new("acme", KeyPurpose::FieldEncryption))
                .await
                .unwrap()
                .version
        }));
    }
    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap());
    }
    versions.sort_unstable();
    assert_eq!(versions, (1..=8).collect::<Vec<u32>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_active_key_is_created_once() {
    let kms = in_memory();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let kms = kms.clone();
        handles.push(tokio::spawn(async move {
            kms.get_active_key_for_purpose("acme", KeyPurpose::DocumentEncryption, Some("uploads"))
                .await
                .unwrap()
                .id
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 1);

    let counts = kms.count_keys_by_status("acme").await.unwrap();
    assert_eq!(counts.active, 1);
    assert_eq!(kms.list_keys("acme", &KeyFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_compromise_racing_rotation_ends_compromised() {
    for round in 0..10 {
        let kms = in_memory();
        let tenant = format!("tenant-{}", round);
        let created = kms
            .create_key(CreateKeyOptions::new(&tenant, KeyPurpose::DataEncryption))
            .await
            .unwrap();

        let rotate = {
            let kms = kms.clone();
            let (key_id, tenant) = (created.id.clone(), tenant.clone());
            tokio::spawn(async move { kms.rotate_key(&key_id, &tenant).await })
        };
        let compromise = {
            let kms = kms.clone();
            let (key_id, tenant) = (created.id.clone(), tenant.clone());
            tokio::spawn(async move { kms.mark_key_compromised(&key_id, &tenant, "key material leaked").await })
        };

        let rotated = rotate.await.unwrap();
        compromise.await.unwrap().unwrap();

        let meta = kms.get_key_metadata(&created.id, &tenant).await.unwrap();
        assert_eq!(meta.status, KeyStatus::Compromised);
        let err = kms.get_key(&created.id, &tenant, None).await.unwrap_err();
        assert!(matches!(err, KmsError::KeyCompromised(_)));

        let keys = kms.list_keys(&tenant, &KeyFilter::default()).await.unwrap();
        match rotated {
            Ok(replacement) => {
                assert_eq!(keys.len(), 2);
                assert_eq!(replacement.status, KeyStatus::Active);
            }
            Err(e) => {
                assert!(matches!(e, KmsError::InvalidStatusTransition(_)));
                assert_eq!(keys.len(), 1);
            }
        }
        assert!(kms.count_keys_by_status(&tenant).await.unwrap().active <= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_keep_succeeding_during_rotation() {
    let kms = in_memory();
    let created = kms
        .create_key(CreateKeyOptions::new("acme", KeyPurpose::DataEncryption))
        .await
        .unwrap();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let kms = kms.clone();
        let key_id = created.id.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..20 {
                kms.get_key(&key_id, "acme", None).await.unwrap();
            }
        }));
    }
    let replacement = kms.rotate_key(&created.id, "acme").await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }

    let deprecated = kms.get_key(&created.id, "acme", None).await.unwrap();
    assert_eq!(deprecated.status, KeyStatus::Deprecated);
    assert_eq!(replacement.version, 2);
}
