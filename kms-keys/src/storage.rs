//! Persistence seam for wrapped key records
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
use crate::error::KmsResult;
use crate::key_types::{
    EncryptedKeyData, KeyFilter, KeyPurpose, KeyStatus, Metadata, StatusCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outcome of a conditional status update
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// The record held the expected status and was updated
    Updated(EncryptedKeyData),
    /// No record with that id exists for the tenant
    NotFound,
    /// The record exists but its status differed from the expected one
    Conflict(KeyStatus),
}

/// Tenant-scoped storage of envelope-encrypted keys.
///
/// Every lookup is keyed by `(key_id, tenant_id)`; a key id saved under one
/// tenant is invisible to all others.
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// Persist a fully formed wrapped key record
    async fn save_key(&self, record: &EncryptedKeyData) -> KmsResult<()>;

    /// Persist a new record as the next version of its tenant and purpose.
    ///
    /// The version on `record` is ignored. Reading the current maximum and
    /// inserting must be atomic so concurrent creates never share a version.
    async fn insert_next_version(&self, record: EncryptedKeyData) -> KmsResult<EncryptedKeyData>;

    /// Fetch a record, or `None` when the id is unknown for this tenant
    async fn get_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<Option<EncryptedKeyData>>;

    /// Highest-version ACTIVE record for a tenant and purpose
    async fn get_latest_key_for_purpose(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
    ) -> KmsResult<Option<EncryptedKeyData>>;

    /// Unconditionally set the status. Returns `false` when no record matched.
    async fn update_key_status(
        &self,
        key_id: &str,
        tenant_id: &str,
        status: KeyStatus,
    ) -> KmsResult<bool>;

    /// Set the status only if it currently equals `expected`
    async fn transition_key_status(
        &self,
        key_id: &str,
        tenant_id: &str,
        expected: KeyStatus,
        new_status: KeyStatus,
    ) -> KmsResult<StatusUpdate>;

    async fn update_last_used(&self, key_id: &str, tenant_id: &str) -> KmsResult<bool>;

    async fn update_key_metadata(
        &self,
        key_id: &str,
        tenant_id: &str,
        expires_at: Option<DateTime<Utc>>,
        metadata: Metadata,
    ) -> KmsResult<bool>;

    /// Replace the wrapped key material (master key re-wrap)
    async fn update_wrapped_key(
        &self,
        key_id: &str,
        tenant_id: &str,
        wrapped: &WrappedKey,
    ) -> KmsResult<bool>;

    /// Records for a tenant, newest first
    async fn list_keys(&self, tenant_id: &str, filter: &KeyFilter)
        -> KmsResult<Vec<EncryptedKeyData>>;

    /// Hard delete. Returns `false` when nothing was removed.
    async fn delete_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<bool>;

    async fn count_keys_by_status(&self, tenant_id: &str) -> KmsResult<StatusCounts>;

    /// Records whose `expires_at` has passed, any status. `None` scans every tenant.
    async fn find_expired_keys(&self, tenant_id: Option<&str>) -> KmsResult<Vec<EncryptedKeyData>>;

    /// Highest version of any status for a tenant and purpose, 0 if none
    async fn max_version(&self, tenant_id: &str, purpose: KeyPurpose) -> KmsResult<u32>;

    /// Liveness check
    async fn ping(&self) -> KmsResult<()>;
}
