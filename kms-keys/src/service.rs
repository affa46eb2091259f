//! Key management facade composing storage, cache, audit and rotation
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


use crate::audit::{
    AuditEventType, AuditFilter, AuditLogEntry, AuditLogger, ExportFormat, SecurityEvent,
    DEFAULT_RETENTION_DAYS,
};
use crate::alerts::AlertManager;
use crate::audit_store::MemoryAuditStore;
use crate::cache::MemoryCache;
use crate::crypto::{key_aad, unwrap_key, wrap_key, WrappedKey};
use crate::error::{KmsError, KmsResult};
use crate::health::{HealthCheck, HealthChecks, HealthStatus, OverallStatus};
use crate::key_cache::{CacheStats, KeyCacheManager};
use crate::key_types::{
    metadata, DecryptedKey, EncryptedKeyData, KeyFilter, KeyMaterial, KeyMetadata, KeyPurpose,
    KeyStatus, Metadata, StatusCounts, DATA_KEY_LEN, DEFAULT_ALGORITHM, DEFAULT_LIST_LIMIT,
};
use crate::local_store::LocalKeyStorage;
use crate::locks::KeyLocks;
use crate::master_key::{MasterKey, MasterKeyManager};
use crate::rotation::{
    FailedRotation, KeyRotationManager, MemoryScheduleStore, RotationReport, RotationSchedule,
};
use crate::storage::{KeyStorage, StatusUpdate};
use crate::validation::{
    validate_key_ref, validate_metadata, validate_service_id, validate_tenant_id,
};
use chrono::{DateTime, Utc};
use kms_config::KmsConfig;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Parameters for a new key
#[derive(Debug, Clone)]
pub struct CreateKeyOptions {
    pub tenant_id: String,
    pub purpose: KeyPurpose,
    /// Only `aes-256-gcm` is supported
    pub algorithm: Option<String>,
    pub auto_rotate: bool,
    /// Defaults to the purpose's rotation period when auto-rotating
    pub rotation_interval_days: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl CreateKeyOptions {
    pub fn new(tenant_id: impl Into<String>, purpose: KeyPurpose) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            purpose,
            algorithm: None,
            auto_rotate: false,
            rotation_interval_days: None,
            expires_at: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_auto_rotation(mut self, interval_days: u32) -> Self {
        self.auto_rotate = true;
        self.rotation_interval_days = Some(interval_days);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Operational settings not owned by any single component
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub audit_retention_days: u32,
    pub suspicious_window_minutes: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            audit_retention_days: DEFAULT_RETENTION_DAYS,
            suspicious_window_minutes: 60,
        }
    }
}

/// A replacement key created for a deprecated one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyReplacement {
    pub tenant_id: String,
    pub old_key_id: String,
    pub new_key_id: String,
    pub new_version: u32,
}

/// Rotation sweep plus the replacement keys it produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRotationReport {
    pub rotation: RotationReport,
    pub replacements: Vec<KeyReplacement>,
    pub replacement_failures: Vec<FailedRotation>,
}

/// Outcome of re-wrapping a tenant's keys under a new master key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewrapReport {
    pub rewrapped: usize,
    pub already_current: usize,
    pub failed: Vec<String>,
}

/// Public entry point for tenant key management
pub struct KeyManagementService {
    master_key: Arc<MasterKeyManager>,
    storage: Arc<dyn KeyStorage>,
    cache: KeyCacheManager,
    audit: AuditLogger,
    rotation: KeyRotationManager,
    alerts: Arc<AlertManager>,
    settings: ServiceSettings,
    /// Serializes cache fills against status changes of the same key
    key_locks: KeyLocks,
    /// Serializes ACTIVE-key creation within a tenant and purpose
    lineage_locks: KeyLocks,
}

impl KeyManagementService {
    /// `rotation` must share `storage` with this service
    pub fn new(
        master_key: Arc<MasterKeyManager>,
        storage: Arc<dyn KeyStorage>,
        cache: KeyCacheManager,
        audit: AuditLogger,
        rotation: KeyRotationManager,
    ) -> Self {
        Self {
            master_key,
            storage,
            cache,
            audit,
            rotation,
            alerts: Arc::new(AlertManager::new()),
            settings: ServiceSettings::default(),
            key_locks: KeyLocks::default(),
            lineage_locks: KeyLocks::default(),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Wire the service over in-process collaborators
    pub fn with_storage(
        master_key: Arc<MasterKeyManager>,
        storage: Arc<dyn KeyStorage>,
        cache_ttl_secs: u64,
        audit_signing_key: Option<&str>,
    ) -> Self {
        let cache = KeyCacheManager::with_ttl(Arc::new(MemoryCache::new()), cache_ttl_secs);
        let audit = AuditLogger::new(Arc::new(MemoryAuditStore::new()), audit_signing_key);
        let rotation =
            KeyRotationManager::new(storage.clone(), Arc::new(MemoryScheduleStore::new()));
        Self::new(master_key, storage, cache, audit, rotation)
    }

    /// Memory-only service
    pub fn in_memory(master_key: Arc<MasterKeyManager>, audit_signing_key: Option<&str>) -> Self {
        Self::with_storage(
            master_key,
            Arc::new(LocalKeyStorage::ephemeral()),
            crate::key_cache::DEFAULT_CACHE_TTL_SECS,
            audit_signing_key,
        )
    }

    /// Build from configuration. Key records persist under
    /// `key_storage_path` when it is set.
    pub async fn from_config(config: &KmsConfig) -> KmsResult<Self> {
        let master_key = Arc::new(MasterKeyManager::new(config.master_key_hex.as_deref())?);
        let storage: Arc<dyn KeyStorage> = match config.key_storage_path.as_deref() {
            Some(path) => Arc::new(LocalKeyStorage::open(path).await?),
            None => Arc::new(LocalKeyStorage::ephemeral()),
        };

        let service = Self::with_storage(
            master_key,
            storage,
            config.cache_ttl_secs,
            config.audit_hmac_key.as_deref(),
        )
        .with_settings(ServiceSettings {
            audit_retention_days: config.audit_retention_days,
            suspicious_window_minutes: config.suspicious_window_minutes,
        });
        info!("Key management service initialized");
        Ok(service)
    }

    pub fn master_key(&self) -> &Arc<MasterKeyManager> {
        &self.master_key
    }

    pub fn storage(&self) -> &Arc<dyn KeyStorage> {
        &self.storage
    }

    pub fn cache(&self) -> &KeyCacheManager {
        &self.cache
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn rotation(&self) -> &KeyRotationManager {
        &self.rotation
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Record a failed operation; a broken audit store must not mask the error
    async fn audited<T>(
        &self,
        result: KmsResult<T>,
        event_type: AuditEventType,
        key_id: Option<&str>,
        tenant_id: &str,
        action: &str,
    ) -> KmsResult<T> {
        if let Err(err) = &result {
            if let Err(audit_err) = self
                .audit
                .log_failure(event_type, key_id, tenant_id, action, err)
                .await
            {
                error!(
                    tenant_id = %tenant_id,
                    action = %action,
                    error = %audit_err,
                    "Failed to audit failed operation"
                );
            }
        }
        result
    }

    fn ensure_usable(
        key_id: &str,
        status: KeyStatus,
        expires_at: Option<DateTime<Utc>>,
    ) -> KmsResult<()> {
        match status {
            KeyStatus::Disabled => return Err(KmsError::KeyDisabled(key_id.to_string())),
            KeyStatus::Compromised => return Err(KmsError::KeyCompromised(key_id.to_string())),
            KeyStatus::Active | KeyStatus::Deprecated => {}
        }
        if matches!(expires_at, Some(at) if at <= Utc::now()) {
            return Err(KmsError::KeyExpired(key_id.to_string()));
        }
        Ok(())
    }

    // ---- creation ----

    /// Generate, wrap and persist a new ACTIVE key
    pub async fn create_key(&self, options: CreateKeyOptions) -> KmsResult<KeyMetadata> {
        let tenant_id = options.tenant_id.clone();
        let result = self
            .create_key_record(options)
            .await
            .map(|record| KeyMetadata::from(&record));
        self.audited(result, AuditEventType::KeyCreated, None, &tenant_id, "create_key")
            .await
    }

    async fn create_key_record(&self, options: CreateKeyOptions) -> KmsResult<EncryptedKeyData> {
        validate_tenant_id(&options.tenant_id)?;
        validate_metadata(&options.metadata)?;
        let algorithm = options
            .algorithm
            .unwrap_or_else(|| DEFAULT_ALGORITHM.to_string());
        if algorithm != DEFAULT_ALGORITHM {
            return Err(KmsError::Validation(format!(
                "unsupported algorithm: {}",
                algorithm
            )));
        }

        let key_id = uuid::Uuid::new_v4().simple().to_string();
        let material = KeyMaterial::generate(DATA_KEY_LEN);
        let master = self.master_key.get_master_key();
        let wrapped = wrap_key(&material, &master, &key_aad(&options.tenant_id, &key_id))?;
        drop(material);

        let now = Utc::now();
        let record = EncryptedKeyData {
            id: key_id,
            tenant_id: options.tenant_id,
            purpose: options.purpose,
            algorithm,
            encrypted_key: wrapped.encrypted_key,
            iv: wrapped.iv,
            auth_tag: wrapped.auth_tag,
            version: 0,
            status: KeyStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: options.expires_at,
            last_used_at: None,
            metadata: options.metadata,
        };
        let record = self.storage.insert_next_version(record).await?;

        if options.auto_rotate {
            let interval = options
                .rotation_interval_days
                .unwrap_or_else(|| record.purpose.default_rotation_period_days());
            self.rotation
                .schedule_rotation(RotationSchedule::new(&record.id, &record.tenant_id, interval))
                .await?;
        }

        self.audit
            .log_key_creation(
                &record.id,
                &record.tenant_id,
                metadata([
                    ("purpose", record.purpose.as_str().to_string()),
                    ("algorithm", record.algorithm.clone()),
                    ("version", record.version.to_string()),
                ]),
            )
            .await?;

        info!(
            key_id = %record.id,
            tenant_id = %record.tenant_id,
            purpose = %record.purpose,
            version = record.version,
            "Key created"
        );
        Ok(record)
    }

    // ---- access ----

    /// Decrypted key for a tenant. Every failure is audited before it is returned.
    pub async fn get_key(
        &self,
        key_id: &str,
        tenant_id: &str,
        service_id: Option<&str>,
    ) -> KmsResult<DecryptedKey> {
        let result = self.fetch_key(key_id, tenant_id, service_id).await;
        self.audited(result, AuditEventType::KeyAccessed, Some(key_id), tenant_id, "access_key")
            .await
    }

    async fn fetch_key(
        &self,
        key_id: &str,
        tenant_id: &str,
        service_id: Option<&str>,
    ) -> KmsResult<DecryptedKey> {
        validate_key_ref(key_id, tenant_id)?;
        if let Some(service_id) = service_id {
            validate_service_id(service_id)?;
        }

        let key = match self.cache.get_cached_key(key_id, tenant_id).await {
            Some(cached) => {
                Self::ensure_usable(key_id, cached.status, cached.expires_at)?;
                cached
            }
            None => {
                let _guard = self.key_locks.lock(tenant_id, key_id).await;
                let record = self
                    .storage
                    .get_key(key_id, tenant_id)
                    .await?
                    .ok_or_else(|| KmsError::not_found(key_id, tenant_id))?;
                Self::ensure_usable(key_id, record.status, record.expires_at)?;

                let master = self.master_key.get_master_key();
                let material = unwrap_key(
                    &WrappedKey::from_record(&record),
                    &master,
                    &key_aad(tenant_id, key_id),
                )?;
                let key = DecryptedKey::from_record(&record, material);

                if let Err(e) = self.cache.cache_key(&key, None).await {
                    warn!(key_id = %key_id, error = %e, "Serving key without caching it");
                }
                key
            }
        };

        self.storage.update_last_used(key_id, tenant_id).await?;
        self.audit.log_key_access(key_id, tenant_id, service_id).await?;
        Ok(key)
    }

    /// Latest ACTIVE key of a purpose, creating the first one when none exists
    pub async fn get_active_key_for_purpose(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        service_id: Option<&str>,
    ) -> KmsResult<DecryptedKey> {
        validate_tenant_id(tenant_id)?;
        let _lineage = self.lineage_locks.lock(tenant_id, purpose.as_str()).await;
        let key_id = match self
            .storage
            .get_latest_key_for_purpose(tenant_id, purpose)
            .await?
        {
            Some(record) => record.id,
            None => {
                info!(tenant_id = %tenant_id, purpose = %purpose, "No active key for purpose, creating one");
                self.create_key(CreateKeyOptions::new(tenant_id, purpose))
                    .await?
                    .id
            }
        };
        self.get_key(&key_id, tenant_id, service_id).await
    }

    /// Key record without material
    pub async fn get_key_metadata(&self, key_id: &str, tenant_id: &str) -> KmsResult<KeyMetadata> {
        validate_key_ref(key_id, tenant_id)?;
        self.storage
            .get_key(key_id, tenant_id)
            .await?
            .map(|record| KeyMetadata::from(&record))
            .ok_or_else(|| KmsError::not_found(key_id, tenant_id))
    }

    pub async fn list_keys(&self, tenant_id: &str, filter: &KeyFilter) -> KmsResult<Vec<KeyMetadata>> {
        validate_tenant_id(tenant_id)?;
        Ok(self
            .storage
            .list_keys(tenant_id, filter)
            .await?
            .iter()
            .map(KeyMetadata::from)
            .collect())
    }

    pub async fn count_keys_by_status(&self, tenant_id: &str) -> KmsResult<StatusCounts> {
        validate_tenant_id(tenant_id)?;
        self.storage.count_keys_by_status(tenant_id).await
    }

    // ---- lifecycle ----

    /// Deprecate an ACTIVE key and create its replacement at the next version.
    /// Returns the replacement.
    pub async fn rotate_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<KeyMetadata> {
        let result = self.rotate_key_inner(key_id, tenant_id).await;
        if let Err(e) = &result {
            if !matches!(
                e,
                KmsError::Validation(_)
                    | KmsError::KeyNotFound { .. }
                    | KmsError::InvalidStatusTransition(_)
            ) {
                self.alerts
                    .handle_rotation_error(key_id, tenant_id, &e.to_string())
                    .await;
            }
        }
        self.audited(result, AuditEventType::KeyRotated, Some(key_id), tenant_id, "rotate_key")
            .await
    }

    async fn rotate_key_inner(&self, key_id: &str, tenant_id: &str) -> KmsResult<KeyMetadata> {
        validate_key_ref(key_id, tenant_id)?;
        let purpose = self
            .storage
            .get_key(key_id, tenant_id)
            .await?
            .ok_or_else(|| KmsError::not_found(key_id, tenant_id))?
            .purpose;
        let _lineage = self.lineage_locks.lock(tenant_id, purpose.as_str()).await;

        let deprecated = {
            let _guard = self.key_locks.lock(tenant_id, key_id).await;
            let deprecated = self.rotation.rotate_key(key_id, tenant_id).await?;
            self.cache.invalidate_key(key_id, tenant_id).await?;
            deprecated
        };

        let replacement = self.create_replacement(&deprecated).await?;
        self.audit
            .log_key_rotation(key_id, &replacement.id, tenant_id)
            .await?;
        self.alerts
            .handle_key_rotated(key_id, &replacement.id, tenant_id)
            .await;

        info!(
            old_key_id = %key_id,
            new_key_id = %replacement.id,
            tenant_id = %tenant_id,
            version = replacement.version,
            "Key rotated"
        );
        Ok(KeyMetadata::from(&replacement))
    }

    /// New key in the same lineage; inherits metadata, lifetime and schedule
    async fn create_replacement(&self, old: &EncryptedKeyData) -> KmsResult<EncryptedKeyData> {
        let now = Utc::now();
        let expires_at = old
            .expires_at
            .map(|expires_at| expires_at - old.created_at)
            .filter(|lifetime| *lifetime > chrono::Duration::zero())
            .map(|lifetime| now + lifetime);

        let mut options = CreateKeyOptions::new(&old.tenant_id, old.purpose)
            .with_metadata(old.metadata.clone());
        options.algorithm = Some(old.algorithm.clone());
        options.expires_at = expires_at;
        let replacement = self.create_key_record(options).await?;

        if let Some(schedule) = self
            .rotation
            .get_rotation_schedule(&old.id, &old.tenant_id)
            .await?
        {
            let mut inherited =
                RotationSchedule::new(&replacement.id, &replacement.tenant_id, schedule.interval_days);
            inherited.enabled = schedule.enabled;
            self.rotation.schedule_rotation(inherited).await?;
            self.rotation.remove_schedule(&old.id, &old.tenant_id).await?;
        }
        Ok(replacement)
    }

    async fn change_status(
        &self,
        key_id: &str,
        tenant_id: &str,
        new_status: KeyStatus,
        reason: Option<&str>,
    ) -> KmsResult<(KeyStatus, EncryptedKeyData)> {
        validate_key_ref(key_id, tenant_id)?;
        let _guard = self.key_locks.lock(tenant_id, key_id).await;
        let current = self
            .storage
            .get_key(key_id, tenant_id)
            .await?
            .ok_or_else(|| KmsError::not_found(key_id, tenant_id))?;
        if !current.status.can_transition_to(new_status) {
            return Err(KmsError::InvalidStatusTransition(format!(
                "Cannot change key status from {} to {}",
                current.status, new_status
            )));
        }

        let updated = match self
            .storage
            .transition_key_status(key_id, tenant_id, current.status, new_status)
            .await?
        {
            StatusUpdate::Updated(record) => record,
            StatusUpdate::NotFound => return Err(KmsError::not_found(key_id, tenant_id)),
            StatusUpdate::Conflict(actual) => {
                return Err(KmsError::InvalidStatusTransition(format!(
                    "Key status changed concurrently to {}",
                    actual
                )))
            }
        };

        self.cache.invalidate_key(key_id, tenant_id).await?;
        self.audit
            .log_key_status_change(key_id, tenant_id, current.status, new_status, reason)
            .await?;

        info!(
            key_id = %key_id,
            tenant_id = %tenant_id,
            from = %current.status,
            to = %new_status,
            "Key status changed"
        );
        Ok((current.status, updated))
    }

    /// Return a DEPRECATED or DISABLED key to ACTIVE
    pub async fn activate_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<KeyMetadata> {
        let result = self
            .change_status(key_id, tenant_id, KeyStatus::Active, None)
            .await
            .map(|(_, record)| KeyMetadata::from(&record));
        self.audited(result, AuditEventType::KeyStatusChanged, Some(key_id), tenant_id, "activate_key")
            .await
    }

    pub async fn deactivate_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<KeyMetadata> {
        let result = self
            .change_status(key_id, tenant_id, KeyStatus::Disabled, None)
            .await
            .map(|(_, record)| KeyMetadata::from(&record));
        self.audited(result, AuditEventType::KeyStatusChanged, Some(key_id), tenant_id, "deactivate_key")
            .await
    }

    /// Flag a key as compromised. The key can never be used again.
    pub async fn mark_key_compromised(
        &self,
        key_id: &str,
        tenant_id: &str,
        reason: &str,
    ) -> KmsResult<KeyMetadata> {
        let result = self.compromise(key_id, tenant_id, reason).await;
        self.audited(result, AuditEventType::SecurityAlert, Some(key_id), tenant_id, "mark_compromised")
            .await
    }

    async fn compromise(&self, key_id: &str, tenant_id: &str, reason: &str) -> KmsResult<KeyMetadata> {
        let (previous, record) = self
            .change_status(key_id, tenant_id, KeyStatus::Compromised, Some(reason))
            .await?;

        self.audit
            .log_security_event(
                SecurityEvent::new(AuditEventType::SecurityAlert, tenant_id, "key_compromised")
                    .with_key(key_id)
                    .with_metadata(metadata([
                        ("reason", reason),
                        ("previousStatus", previous.as_str()),
                    ])),
            )
            .await?;

        self.alerts
            .handle_key_compromised(key_id, tenant_id, reason)
            .await;
        warn!(key_id = %key_id, tenant_id = %tenant_id, reason = %reason, "Key marked as compromised");
        Ok(KeyMetadata::from(&record))
    }

    /// Hard delete. ACTIVE keys require `force`.
    pub async fn delete_key(&self, key_id: &str, tenant_id: &str, force: bool) -> KmsResult<()> {
        let result = self.delete_key_inner(key_id, tenant_id, force).await;
        self.audited(result, AuditEventType::KeyDeleted, Some(key_id), tenant_id, "delete_key")
            .await
    }

    async fn delete_key_inner(&self, key_id: &str, tenant_id: &str, force: bool) -> KmsResult<()> {
        validate_key_ref(key_id, tenant_id)?;
        let _guard = self.key_locks.lock(tenant_id, key_id).await;
        let record = self
            .storage
            .get_key(key_id, tenant_id)
            .await?
            .ok_or_else(|| KmsError::not_found(key_id, tenant_id))?;
        if record.status == KeyStatus::Active && !force {
            return Err(KmsError::InvalidStatusTransition(
                "Cannot delete active key without force flag".to_string(),
            ));
        }

        if !self.storage.delete_key(key_id, tenant_id).await? {
            return Err(KmsError::not_found(key_id, tenant_id));
        }
        self.cache.invalidate_key(key_id, tenant_id).await?;
        self.rotation.remove_schedule(key_id, tenant_id).await?;
        self.audit.log_key_deletion(key_id, tenant_id, force).await?;

        info!(key_id = %key_id, tenant_id = %tenant_id, force, "Key deleted");
        Ok(())
    }

    // ---- rotation ----

    /// Run the rotation sweep and create a replacement for every key it deprecated
    pub async fn run_scheduled_rotations(&self) -> KmsResult<ScheduledRotationReport> {
        let rotation = self.rotation.check_and_rotate_expired_keys().await?;
        let mut report = ScheduledRotationReport::default();

        for failed in &rotation.failed_keys {
            self.alerts
                .handle_rotation_error(&failed.key_id, &failed.tenant_id, &failed.reason)
                .await;
        }

        for rotated in &rotation.rotated_keys {
            match self.replace_rotated(&rotated.key_id, &rotated.tenant_id).await {
                Ok(replacement) => report.replacements.push(replacement),
                Err(e) => {
                    error!(
                        key_id = %rotated.key_id,
                        tenant_id = %rotated.tenant_id,
                        error = %e,
                        "Failed to create replacement key"
                    );
                    if let Err(audit_err) = self
                        .audit
                        .log_failure(
                            AuditEventType::KeyRotated,
                            Some(&rotated.key_id),
                            &rotated.tenant_id,
                            "rotate_key",
                            &e,
                        )
                        .await
                    {
                        error!(error = %audit_err, "Failed to audit failed rotation");
                    }
                    self.alerts
                        .handle_rotation_error(&rotated.key_id, &rotated.tenant_id, &e.to_string())
                        .await;
                    report.replacement_failures.push(FailedRotation {
                        key_id: rotated.key_id.clone(),
                        tenant_id: rotated.tenant_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.rotation = rotation;
        Ok(report)
    }

    async fn replace_rotated(&self, key_id: &str, tenant_id: &str) -> KmsResult<KeyReplacement> {
        let old = {
            let _guard = self.key_locks.lock(tenant_id, key_id).await;
            self.cache.invalidate_key(key_id, tenant_id).await?;
            self.storage
                .get_key(key_id, tenant_id)
                .await?
                .ok_or_else(|| KmsError::not_found(key_id, tenant_id))?
        };

        let _lineage = self.lineage_locks.lock(tenant_id, old.purpose.as_str()).await;
        let replacement = self.create_replacement(&old).await?;
        self.audit
            .log_key_rotation(key_id, &replacement.id, tenant_id)
            .await?;
        Ok(KeyReplacement {
            tenant_id: tenant_id.to_string(),
            old_key_id: key_id.to_string(),
            new_key_id: replacement.id,
            new_version: replacement.version,
        })
    }

    /// Re-wrap every key of a tenant under the current master key.
    ///
    /// Call after `MasterKeyManager::rotate_master_key`, passing the key it
    /// returned. Keys already wrapped under the current master are skipped.
    pub async fn rewrap_keys(&self, tenant_id: &str, previous: &MasterKey) -> KmsResult<RewrapReport> {
        validate_tenant_id(tenant_id)?;
        let current = self.master_key.get_master_key();
        let mut report = RewrapReport::default();

        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .storage
                .list_keys(
                    tenant_id,
                    &KeyFilter {
                        limit: Some(DEFAULT_LIST_LIMIT),
                        offset: Some(offset),
                        ..KeyFilter::default()
                    },
                )
                .await?;
            let fetched = page.len();
            records.extend(page);
            if fetched < DEFAULT_LIST_LIMIT {
                break;
            }
            offset += fetched;
        }

        for record in records {
            let aad = key_aad(&record.tenant_id, &record.id);
            let wrapped = WrappedKey::from_record(&record);
            let material = match unwrap_key(&wrapped, previous, &aad) {
                Ok(material) => material,
                Err(_) if unwrap_key(&wrapped, &current, &aad).is_ok() => {
                    report.already_current += 1;
                    continue;
                }
                Err(e) => {
                    error!(key_id = %record.id, tenant_id = %tenant_id, error = %e, "Cannot unwrap key for re-wrap");
                    report.failed.push(record.id);
                    continue;
                }
            };

            let rewrapped = match wrap_key(&material, &current, &aad) {
                Ok(rewrapped) => rewrapped,
                Err(e) => {
                    error!(key_id = %record.id, error = %e, "Re-wrap failed");
                    report.failed.push(record.id);
                    continue;
                }
            };
            match self
                .storage
                .update_wrapped_key(&record.id, tenant_id, &rewrapped)
                .await
            {
                Ok(true) => report.rewrapped += 1,
                Ok(false) => report.failed.push(record.id),
                Err(e) => {
                    error!(key_id = %record.id, error = %e, "Failed to store re-wrapped key");
                    report.failed.push(record.id);
                }
            }
        }

        info!(
            tenant_id = %tenant_id,
            rewrapped = report.rewrapped,
            already_current = report.already_current,
            failed = report.failed.len(),
            "Master key re-wrap completed"
        );
        Ok(report)
    }

    // ---- operations ----

    /// Run every dependency check and aggregate the result
    pub async fn get_health_status(&self) -> HealthStatus {
        let master_key = if self.master_key.validate_master_key() {
            HealthCheck::pass()
        } else {
            HealthCheck::fail("Master key failed validation")
        };

        let storage = match self.storage.ping().await {
            Ok(()) => HealthCheck::pass(),
            Err(e) => HealthCheck::fail(e.to_string()),
        };

        let cache = match self.cache.health_check().await {
            Ok(()) => HealthCheck::pass(),
            Err(e) => HealthCheck::fail(e.to_string()),
        };

        let rotation = match self.overdue_rotation_keys().await {
            Ok(overdue) if overdue.is_empty() => HealthCheck::pass(),
            Ok(overdue) => {
                self.alerts
                    .handle_overdue_rotations(overdue.len(), &overdue)
                    .await;
                HealthCheck::fail(format!("{} key rotation(s) overdue", overdue.len()))
            }
            Err(e) => HealthCheck::fail(e.to_string()),
        };

        for (component, check) in [("master_key", &master_key), ("storage", &storage), ("cache", &cache)] {
            if !check.passed() {
                let message = check.message.as_deref().unwrap_or("check failed");
                self.alerts
                    .handle_health_check_failure(component, message)
                    .await;
            }
        }

        let health = HealthStatus::from_checks(HealthChecks {
            master_key,
            storage,
            cache,
            rotation,
        });
        if health.status != OverallStatus::Healthy {
            warn!(status = %health.status, "Key management service is not healthy");
        }
        health
    }

    /// Ids of enabled schedules whose next rotation has passed
    async fn overdue_rotation_keys(&self) -> KmsResult<Vec<String>> {
        let now = Utc::now();
        Ok(self
            .rotation
            .list_auto_rotation_keys(None)
            .await?
            .into_iter()
            .filter(|schedule| schedule.next_rotation_at < now)
            .map(|schedule| schedule.key_id)
            .collect())
    }

    /// `true` when the key can be fetched and decrypted
    pub async fn validate_key_integrity(&self, key_id: &str, tenant_id: &str) -> bool {
        let outcome = async {
            validate_key_ref(key_id, tenant_id)?;
            let record = self
                .storage
                .get_key(key_id, tenant_id)
                .await?
                .ok_or_else(|| KmsError::not_found(key_id, tenant_id))?;
            let master = self.master_key.get_master_key();
            let material = unwrap_key(
                &WrappedKey::from_record(&record),
                &master,
                &key_aad(tenant_id, key_id),
            )?;
            if material.len() != DATA_KEY_LEN {
                return Err(KmsError::Decryption(format!(
                    "unexpected key length {}",
                    material.len()
                )));
            }
            Ok::<(), KmsError>(())
        }
        .await;

        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!(key_id = %key_id, tenant_id = %tenant_id, error = %e, "Key integrity check failed");
                false
            }
        }
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.cache.get_cache_stats().await
    }

    pub async fn query_audit_log(&self, filter: &AuditFilter) -> KmsResult<Vec<AuditLogEntry>> {
        self.audit.query_audit_log(filter).await
    }

    pub async fn export_audit_log(&self, filter: &AuditFilter, format: ExportFormat) -> KmsResult<String> {
        self.audit.export_logs(filter, format).await
    }

    pub fn verify_audit_entry(&self, entry: &AuditLogEntry) -> bool {
        self.audit.verify_log_entry(entry)
    }

    /// Failures and alerts within the configured window
    pub async fn find_suspicious_activity(&self, tenant_id: &str) -> KmsResult<Vec<AuditLogEntry>> {
        validate_tenant_id(tenant_id)?;
        self.audit
            .find_suspicious_activity(tenant_id, i64::from(self.settings.suspicious_window_minutes))
            .await
    }

    /// Purge audit entries beyond the configured retention
    pub async fn cleanup_audit_logs(&self) -> KmsResult<usize> {
        self.audit
            .cleanup_old_logs(self.settings.audit_retention_days)
            .await
    }
}
