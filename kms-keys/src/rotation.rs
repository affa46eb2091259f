//! Key rotation scheduling, execution and re-encryption orchestration
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
use crate::key_types::{EncryptedKeyData, KeyId, KeyStatus, TenantId};
use crate::storage::{KeyStorage, StatusUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Window counted as "upcoming" in rotation stats
pub const UPCOMING_WINDOW_DAYS: i64 = 7;

/// Automatic rotation settings for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationSchedule {
    pub key_id: KeyId,
    pub tenant_id: TenantId,
    pub enabled: bool,
    pub interval_days: u32,
    pub next_rotation_at: DateTime<Utc>,
    pub last_rotation_at: Option<DateTime<Utc>>,
}

impl RotationSchedule {
    /// Enabled schedule whose first rotation is `interval_days` from now
    pub fn new(key_id: impl Into<String>, tenant_id: impl Into<String>, interval_days: u32) -> Self {
        Self {
            key_id: key_id.into(),
            tenant_id: tenant_id.into(),
            enabled: true,
            interval_days,
            next_rotation_at: Utc::now() + Duration::days(i64::from(interval_days)),
            last_rotation_at: None,
        }
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_rotation_at <= now
    }

    fn mark_rotated(&mut self, at: DateTime<Utc>) {
        self.last_rotation_at = Some(at);
        self.next_rotation_at = at + Duration::days(i64::from(self.interval_days));
    }
}

/// Persistence seam for rotation schedules, keyed by `(tenant_id, key_id)`
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn upsert(&self, schedule: RotationSchedule) -> KmsResult<()>;

    async fn get(&self, key_id: &str, tenant_id: &str) -> KmsResult<Option<RotationSchedule>>;

    async fn remove(&self, key_id: &str, tenant_id: &str) -> KmsResult<bool>;

    /// All schedules, optionally for one tenant
    async fn list(&self, tenant_id: Option<&str>) -> KmsResult<Vec<RotationSchedule>>;
}

#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<(TenantId, KeyId), RotationSchedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn upsert(&self, schedule: RotationSchedule) -> KmsResult<()> {
        let mut schedules = self.schedules.write().await;
        schedules.insert(
            (schedule.tenant_id.clone(), schedule.key_id.clone()),
            schedule,
        );
        Ok(())
    }

    async fn get(&self, key_id: &str, tenant_id: &str) -> KmsResult<Option<RotationSchedule>> {
        let schedules = self.schedules.read().await;
        Ok(schedules
            .get(&(tenant_id.to_string(), key_id.to_string()))
            .cloned())
    }

    async fn remove(&self, key_id: &str, tenant_id: &str) -> KmsResult<bool> {
        let mut schedules = self.schedules.write().await;
        Ok(schedules
            .remove(&(tenant_id.to_string(), key_id.to_string()))
            .is_some())
    }

    async fn list(&self, tenant_id: Option<&str>) -> KmsResult<Vec<RotationSchedule>> {
        let schedules = self.schedules.read().await;
        Ok(schedules
            .values()
            .filter(|s| tenant_id.map_or(true, |t| s.tenant_id == t))
            .cloned()
            .collect())
    }
}

/// Caller-supplied re-encryption of data protected by a rotated key
#[async_trait]
pub trait ReEncryptor: Send + Sync {
    async fn re_encrypt(
        &self,
        old_key_id: &str,
        new_key_id: &str,
        table: &str,
        column: &str,
        ids: &[String],
    ) -> anyhow::Result<()>;
}

/// External rows that must be re-encrypted after a rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataReference {
    pub table: String,
    pub column: String,
    pub id_column: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationTrigger {
    Scheduled,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotatedKey {
    pub key_id: KeyId,
    pub tenant_id: TenantId,
    pub trigger: RotationTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRotation {
    pub key_id: KeyId,
    pub tenant_id: TenantId,
    pub reason: String,
}

/// Outcome of a rotation sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationReport {
    pub rotated_keys: Vec<RotatedKey>,
    pub failed_keys: Vec<FailedRotation>,
    pub total_processed: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReEncryptionSummary {
    pub total_records: usize,
    pub successful_records: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationStats {
    pub total_scheduled: usize,
    pub active_schedules: usize,
    pub upcoming_rotations: usize,
    pub overdue_rotations: usize,
}

/// Deprecates keys on demand or on schedule. Creating the replacement key is
/// left to the caller.
pub struct KeyRotationManager {
    storage: Arc<dyn KeyStorage>,
    schedules: Arc<dyn ScheduleStore>,
}

impl KeyRotationManager {
    pub fn new(storage: Arc<dyn KeyStorage>, schedules: Arc<dyn ScheduleStore>) -> Self {
        Self { storage, schedules }
    }

    /// Move an ACTIVE key to DEPRECATED and return the updated record.
    ///
    /// Only one of several concurrent callers can succeed; the rest observe
    /// the new status and fail.
    pub async fn rotate_key(&self, key_id: &str, tenant_id: &str) -> KmsResult<EncryptedKeyData> {
        match self
            .storage
            .transition_key_status(key_id, tenant_id, KeyStatus::Active, KeyStatus::Deprecated)
            .await?
        {
            StatusUpdate::Updated(record) => {
                info!(key_id = %key_id, tenant_id = %tenant_id, version = record.version, "Key deprecated for rotation");
                Ok(record)
            }
            StatusUpdate::NotFound => Err(KmsError::not_found(key_id, tenant_id)),
            StatusUpdate::Conflict(status) => Err(KmsError::InvalidStatusTransition(format!(
                "Cannot rotate key with status {}",
                status
            ))),
        }
    }

    /// Create or replace the schedule for an existing key
    pub async fn schedule_rotation(&self, schedule: RotationSchedule) -> KmsResult<()> {
        if schedule.interval_days == 0 {
            return Err(KmsError::Validation(
                "Rotation interval must be at least one day".to_string(),
            ));
        }
        if self
            .storage
            .get_key(&schedule.key_id, &schedule.tenant_id)
            .await?
            .is_none()
        {
            return Err(KmsError::not_found(&schedule.key_id, &schedule.tenant_id));
        }

        info!(
            key_id = %schedule.key_id,
            tenant_id = %schedule.tenant_id,
            interval_days = schedule.interval_days,
            "Rotation scheduled"
        );
        self.schedules.upsert(schedule).await
    }

    /// Rotate every key whose schedule is due, then every ACTIVE key past its
    /// expiry. A failure on one key never stops the sweep.
    pub async fn check_and_rotate_expired_keys(&self) -> KmsResult<RotationReport> {
        let started = Instant::now();
        let now = Utc::now();
        let mut report = RotationReport::default();

        let due: Vec<RotationSchedule> = self
            .schedules
            .list(None)
            .await?
            .into_iter()
            .filter(|s| s.is_due_at(now))
            .collect();
        info!(count = due.len(), "Keys due for scheduled rotation");

        for mut schedule in due {
            match self.rotate_key(&schedule.key_id, &schedule.tenant_id).await {
                Ok(_) => {
                    schedule.mark_rotated(Utc::now());
                    let (key_id, tenant_id) = (schedule.key_id.clone(), schedule.tenant_id.clone());
                    if let Err(e) = self.schedules.upsert(schedule).await {
                        warn!(key_id = %key_id, error = %e, "Failed to advance rotation schedule");
                    }
                    report.rotated_keys.push(RotatedKey {
                        key_id,
                        tenant_id,
                        trigger: RotationTrigger::Scheduled,
                    });
                }
                Err(e) => {
                    error!(key_id = %schedule.key_id, tenant_id = %schedule.tenant_id, error = %e, "Scheduled rotation failed");
                    report.failed_keys.push(FailedRotation {
                        key_id: schedule.key_id,
                        tenant_id: schedule.tenant_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let expired: Vec<EncryptedKeyData> = self
            .storage
            .find_expired_keys(None)
            .await?
            .into_iter()
            .filter(|r| r.status == KeyStatus::Active)
            .collect();

        for record in expired {
            match self.rotate_key(&record.id, &record.tenant_id).await {
                Ok(_) => report.rotated_keys.push(RotatedKey {
                    key_id: record.id,
                    tenant_id: record.tenant_id,
                    trigger: RotationTrigger::Expired,
                }),
                Err(e) => {
                    error!(key_id = %record.id, tenant_id = %record.tenant_id, error = %e, "Rotation of expired key failed");
                    report.failed_keys.push(FailedRotation {
                        key_id: record.id,
                        tenant_id: record.tenant_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.total_processed = report.rotated_keys.len() + report.failed_keys.len();
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            rotated = report.rotated_keys.len(),
            failed = report.failed_keys.len(),
            duration_ms = report.duration_ms,
            "Rotation check completed"
        );
        Ok(report)
    }

    /// Hand every data reference to the re-encryptor.
    ///
    /// Without a re-encryptor this is a no-op. Failed references do not stop
    /// the remaining ones and nothing is rolled back; any failure yields
    /// `ReEncryptionPartialFailure`.
    pub async fn re_encrypt_data(
        &self,
        old_key_id: &str,
        new_key_id: &str,
        data_refs: &[DataReference],
        re_encryptor: Option<&dyn ReEncryptor>,
    ) -> KmsResult<ReEncryptionSummary> {
        info!(
            old_key_id = %old_key_id,
            new_key_id = %new_key_id,
            references = data_refs.len(),
            "Starting re-encryption"
        );

        let Some(re_encryptor) = re_encryptor else {
            warn!("No re-encryptor supplied, re-encryption left to the data owner");
            return Ok(ReEncryptionSummary::default());
        };

        let mut summary = ReEncryptionSummary::default();
        let mut failed = 0usize;
        let mut failures = Vec::new();

        for data_ref in data_refs {
            summary.total_records += data_ref.ids.len();
            debug!(table = %data_ref.table, column = %data_ref.column, records = data_ref.ids.len(), "Re-encrypting");

            match re_encryptor
                .re_encrypt(old_key_id, new_key_id, &data_ref.table, &data_ref.column, &data_ref.ids)
                .await
            {
                Ok(()) => summary.successful_records += data_ref.ids.len(),
                Err(e) => {
                    error!(table = %data_ref.table, column = %data_ref.column, error = %e, "Re-encryption failed");
                    failed += data_ref.ids.len();
                    failures.push(format!("{}.{}: {}", data_ref.table, data_ref.column, e));
                }
            }
        }

        info!(
            total = summary.total_records,
            successful = summary.successful_records,
            failed,
            "Re-encryption completed"
        );

        if !failures.is_empty() {
            return Err(KmsError::ReEncryptionPartialFailure {
                failed,
                total: summary.total_records,
                failures,
            });
        }
        Ok(summary)
    }

    pub async fn get_rotation_schedule(
        &self,
        key_id: &str,
        tenant_id: &str,
    ) -> KmsResult<Option<RotationSchedule>> {
        self.schedules.get(key_id, tenant_id).await
    }

    async fn set_enabled(&self, key_id: &str, tenant_id: &str, enabled: bool) -> KmsResult<()> {
        let mut schedule = self
            .schedules
            .get(key_id, tenant_id)
            .await?
            .ok_or_else(|| KmsError::not_found(key_id, tenant_id))?;
        schedule.enabled = enabled;
        self.schedules.upsert(schedule).await?;
        info!(key_id = %key_id, tenant_id = %tenant_id, enabled, "Auto-rotation updated");
        Ok(())
    }

    pub async fn disable_auto_rotation(&self, key_id: &str, tenant_id: &str) -> KmsResult<()> {
        self.set_enabled(key_id, tenant_id, false).await
    }

    /// Fails when the key has no schedule
    pub async fn enable_auto_rotation(&self, key_id: &str, tenant_id: &str) -> KmsResult<()> {
        self.set_enabled(key_id, tenant_id, true).await
    }

    pub async fn remove_schedule(&self, key_id: &str, tenant_id: &str) -> KmsResult<bool> {
        self.schedules.remove(key_id, tenant_id).await
    }

    pub async fn get_rotation_stats(&self, tenant_id: Option<&str>) -> KmsResult<RotationStats> {
        let now = Utc::now();
        let horizon = now + Duration::days(UPCOMING_WINDOW_DAYS);
        let schedules = self.schedules.list(tenant_id).await?;

        let mut stats = RotationStats {
            total_scheduled: schedules.len(),
            ..RotationStats::default()
        };
        for schedule in schedules.iter().filter(|s| s.enabled) {
            stats.active_schedules += 1;
            if schedule.next_rotation_at < now {
                stats.overdue_rotations += 1;
            } else if schedule.next_rotation_at <= horizon {
                stats.upcoming_rotations += 1;
            }
        }
        Ok(stats)
    }

    /// Enabled schedules, soonest first
    pub async fn list_auto_rotation_keys(
        &self,
        tenant_id: Option<&str>,
    ) -> KmsResult<Vec<RotationSchedule>> {
        let mut schedules: Vec<RotationSchedule> = self
            .schedules
            .list(tenant_id)
            .await?
            .into_iter()
            .filter(|s| s.enabled)
            .collect();
        schedules.sort_by_key(|s| s.next_rotation_at);
        Ok(schedules)
    }
}
