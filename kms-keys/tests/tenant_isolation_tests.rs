//! Cross-tenant isolation tests
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


use kms_keys::crypto::{key_aad, unwrap_key, WrappedKey};
use kms_keys::{
    AuditFilter, CreateKeyOptions, KeyManagementService, KeyPurpose, KeyStorage, KmsError,
    LocalKeyStorage, MasterKeyManager,
};
use std::sync::Arc;

const MASTER: &str = "4f1c2a9be07d3368a5c1f0e2d4b7986a13579bdf2468ace0f1e2d3c4b5a69788";

fn service() -> KeyManagementService {
    let master = Arc::new(MasterKeyManager::from_hex(MASTER).unwrap());
    KeyManagementService::in_memory(master, Some("isolation-audit-key"))
}

#[tokio::test]
async fn test_key_invisible_to_other_tenant() {
    let kms = service();
    let key = kms
        .create_key(CreateKeyOptions::new("tenant-a", KeyPurpose::DataEncryption))
        .await
        .unwrap();
    kms.get_key(&key.id, "tenant-a", None).await.unwrap();

    // Cached under tenant-a, still refused for tenant-b
    let err = kms.get_key(&key.id, "tenant-b", None).await.unwrap_err();
    assert!(matches!(err, KmsError::KeyNotFound { .. }));
    assert!(kms.get_key_metadata(&key.id, "tenant-b").await.is_err());
    assert!(kms.list_keys("tenant-b", &Default::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lifecycle_calls_scoped_to_tenant() {
    let kms = service();
    let key = kms
        .create_key(CreateKeyOptions::new("tenant-a", KeyPurpose::DataEncryption))
        .await
        .unwrap();

    assert!(matches!(
        kms.rotate_key(&key.id, "tenant-b").await.unwrap_err(),
        KmsError::KeyNotFound { .. }
    ));
    assert!(matches!(
        kms.deactivate_key(&key.id, "tenant-b").await.unwrap_err(),
        KmsError::KeyNotFound { .. }
    ));
    assert!(matches!(
        kms.delete_key(&key.id, "tenant-b", true).await.unwrap_err(),
        KmsError::KeyNotFound { .. }
    ));

    let meta = kms.get_key_metadata(&key.id, "tenant-a").await.unwrap();
    assert_eq!(meta.version, 1);
    assert!(kms.get_key(&key.id, "tenant-a", None).await.is_ok());
}

#[tokio::test]
async fn test_versions_are_per_tenant() {
    let kms = service();
    for _ in 0..3 {
        kms.create_key(CreateKeyOptions::new("tenant-a", KeyPurpose::FieldEncryption))
            .await
            .unwrap();
    }
    let b = kms
        .create_key(CreateKeyOptions::new("tenant-b", KeyPurpose::FieldEncryption))
        .await
        .unwrap();
    assert_eq!(b.version, 1);

    let a_counts = kms.count_keys_by_status("tenant-a").await.unwrap();
    let b_counts = kms.count_keys_by_status("tenant-b").await.unwrap();
    assert_eq!(a_counts.active, 3);
    assert_eq!(b_counts.active, 1);
}

#[tokio::test]
async fn test_wrapped_key_bound_to_tenant() {
    let storage = Arc::new(LocalKeyStorage::ephemeral());
    let master = Arc::new(MasterKeyManager::from_hex(MASTER).unwrap());
    let kms = KeyManagementService::with_storage(master.clone(), storage.clone(), 60, None);
    let key = kms
        .create_key(CreateKeyOptions::new("tenant-a", KeyPurpose::DataEncryption))
        .await
        .unwrap();

    let record = storage.get_key(&key.id, "tenant-a").await.unwrap().unwrap();
    let wrapped = WrappedKey::from_record(&record);
    let mk = master.get_master_key();

    assert!(unwrap_key(&wrapped, &mk, &key_aad("tenant-a", &key.id)).is_ok());
    let err = unwrap_key(&wrapped, &mk, &key_aad("tenant-b", &key.id)).unwrap_err();
    assert!(matches!(err, KmsError::Decryption(_)));
}

#[tokio::test]
async fn test_audit_trail_per_tenant() {
    let kms = service();
    kms.create_key(CreateKeyOptions::new("tenant-a", KeyPurpose::DataEncryption))
        .await
        .unwrap();
    kms.create_key(CreateKeyOptions::new("tenant-b", KeyPurpose::DataEncryption))
        .await
        .unwrap();
    let _ = kms.get_key("missing", "tenant-b", None).await;

    let a = kms
        .query_audit_log(&AuditFilter::for_tenant("tenant-a"))
        .await
        .unwrap();
    let b = kms
        .query_audit_log(&AuditFilter::for_tenant("tenant-b"))
        .await
        .unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 2);
    assert!(a.iter().all(|e| e.tenant_id == "tenant-a"));

    assert!(kms.find_suspicious_activity("tenant-a").await.unwrap().is_empty());
    assert_eq!(kms.find_suspicious_activity("tenant-b").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_tenant_cache_invalidation() {
    let kms = service();
    let a = kms
        .create_key(CreateKeyOptions::new("tenant-a", KeyPurpose::DataEncryption))
        .await
        .unwrap();
    let b = kms
        .create_key(CreateKeyOptions::new("tenant-b", KeyPurpose::DataEncryption))
        .await
        .unwrap();
    kms.get_key(&a.id, "tenant-a", None).await.unwrap();
    kms.get_key(&b.id, "tenant-b", None).await.unwrap();

    assert_eq!(kms.cache().invalidate_tenant_keys("tenant-a").await.unwrap(), 1);
    assert!(!kms.cache().is_cached(&a.id, "tenant-a").await);
    assert!(kms.cache().is_cached(&b.id, "tenant-b").await);
}
