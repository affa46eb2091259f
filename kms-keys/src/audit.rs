//! HMAC-signed audit trail of key lifecycle and security events
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


use crate::audit_store::AuditStore;
use crate::error::{KmsError, KmsResult};
use crate::key_types::{metadata, KeyStatus, Metadata};
use crate::validation::{validate_ip_address, validate_metadata};
use chrono::{DateTime, Days, Duration, NaiveTime, SecondsFormat, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Version tag mixed into every signature
pub const CANONICAL_VERSION: &str = "kms-audit-v1";

/// Default page size for audit queries
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Default retention window (7 years)
pub const DEFAULT_RETENTION_DAYS: u32 = 2555;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    KeyCreated,
    KeyAccessed,
    KeyRotated,
    KeyStatusChanged,
    KeyDeleted,
    SecurityAlert,
    UnauthorizedAccess,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 7] = [
        AuditEventType::KeyCreated,
        AuditEventType::KeyAccessed,
        AuditEventType::KeyRotated,
        AuditEventType::KeyStatusChanged,
        AuditEventType::KeyDeleted,
        AuditEventType::SecurityAlert,
        AuditEventType::UnauthorizedAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::KeyCreated => "KEY_CREATED",
            AuditEventType::KeyAccessed => "KEY_ACCESSED",
            AuditEventType::KeyRotated => "KEY_ROTATED",
            AuditEventType::KeyStatusChanged => "KEY_STATUS_CHANGED",
            AuditEventType::KeyDeleted => "KEY_DELETED",
            AuditEventType::SecurityAlert => "SECURITY_ALERT",
            AuditEventType::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
        }
    }

    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            AuditEventType::SecurityAlert | AuditEventType::UnauthorizedAccess
        )
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Failure => "failure",
        }
    }
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub tenant_id: String,
    pub key_id: Option<String>,
    pub service_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub action: String,
    pub result: AuditResult,
    #[serde(default)]
    pub metadata: Metadata,
    pub hmac_signature: String,
}

/// Fixed field order fed to the HMAC. Changing it requires a new version tag.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalEntry<'a> {
    version: &'static str,
    id: &'a str,
    timestamp: String,
    event_type: AuditEventType,
    tenant_id: &'a str,
    key_id: Option<&'a str>,
    service_id: Option<&'a str>,
    user_id: Option<&'a str>,
    ip_address: Option<&'a str>,
    action: &'a str,
    result: AuditResult,
    metadata: &'a Metadata,
}

/// Canonical byte representation of an entry, excluding its signature
pub fn canonicalize(entry: &AuditLogEntry) -> KmsResult<Vec<u8>> {
    let canonical = CanonicalEntry {
        version: CANONICAL_VERSION,
        id: &entry.id,
        timestamp: entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        event_type: entry.event_type,
        tenant_id: &entry.tenant_id,
        key_id: entry.key_id.as_deref(),
        service_id: entry.service_id.as_deref(),
        user_id: entry.user_id.as_deref(),
        ip_address: entry.ip_address.as_deref(),
        action: &entry.action,
        result: entry.result,
        metadata: &entry.metadata,
    };
    Ok(serde_json::to_vec(&canonical)?)
}

/// HMAC-SHA256 over canonical bytes, hex encoded
pub fn sign(canonical: &[u8], signing_key: &[u8]) -> KmsResult<String> {
    let mut mac = HmacSha256::new_from_slice(signing_key)
        .map_err(|e| KmsError::AuditLog(format!("Invalid signing key: {}", e)))?;
    mac.update(canonical);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_signature(canonical: &[u8], signing_key: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(signing_key) else {
        return false;
    };
    mac.update(canonical);
    mac.verify_slice(&signature).is_ok()
}

/// An event to record. Built up with the `with_*` methods.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub event_type: AuditEventType,
    pub tenant_id: String,
    pub key_id: Option<String>,
    pub service_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub action: String,
    pub result: AuditResult,
    pub metadata: Metadata,
}

impl SecurityEvent {
    pub fn new(
        event_type: AuditEventType,
        tenant_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            tenant_id: tenant_id.into(),
            key_id: None,
            service_id: None,
            user_id: None,
            ip_address: None,
            action: action.into(),
            result: AuditResult::Success,
            metadata: Metadata::new(),
        }
    }

    pub fn with_key(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn failed(mut self) -> Self {
        self.result = AuditResult::Failure;
        self
    }
}

/// Audit query filter. `limit: None` means the default page size.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub tenant_id: Option<String>,
    pub key_id: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub service_id: Option<String>,
    pub user_id: Option<String>,
    pub result: Option<AuditResult>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AuditFilter {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        fn eq_opt(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().map_or(true, |w| have == Some(w))
        }

        eq_opt(&self.tenant_id, Some(entry.tenant_id.as_str()))
            && eq_opt(&self.key_id, entry.key_id.as_deref())
            && eq_opt(&self.service_id, entry.service_id.as_deref())
            && eq_opt(&self.user_id, entry.user_id.as_deref())
            && self.event_type.map_or(true, |t| t == entry.event_type)
            && self.result.map_or(true, |r| r == entry.result)
            && self.start.map_or(true, |s| entry.timestamp >= s)
            && self.end.map_or(true, |e| entry.timestamp <= e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }
}

/// Result of verifying a batch of entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditVerification {
    pub total: usize,
    pub valid: usize,
    pub invalid_ids: Vec<String>,
}

const CSV_HEADER: &str = "timestamp,eventType,keyId,tenantId,action,result,serviceId,userId";

fn csv_field(value: &str) -> String {
    if value.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn to_csv(entries: &[AuditLogEntry]) -> String {
    let mut lines = Vec::with_capacity(entries.len() + 1);
    lines.push(CSV_HEADER.to_string());
    for entry in entries {
        let timestamp = entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        let row = [
            timestamp.as_str(),
            entry.event_type.as_str(),
            entry.key_id.as_deref().unwrap_or(""),
            entry.tenant_id.as_str(),
            entry.action.as_str(),
            entry.result.as_str(),
            entry.service_id.as_deref().unwrap_or(""),
            entry.user_id.as_deref().unwrap_or(""),
        ];
        lines.push(
            row.iter()
                .map(|field| csv_field(field))
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    lines.join("\n")
}

/// Records and queries signed audit entries
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    signing_key: Zeroizing<Vec<u8>>,
}

impl AuditLogger {
    /// Create a logger. Without a signing key a random one is generated and
    /// entries will not verify after a restart.
    pub fn new(store: Arc<dyn AuditStore>, signing_key: Option<&str>) -> Self {
        let signing_key = match signing_key.filter(|k| !k.is_empty()) {
            Some(key) => Zeroizing::new(key.as_bytes().to_vec()),
            None => {
                warn!("No audit signing key configured, generated an ephemeral one");
                let generated = crate::key_types::KeyMaterial::generate(32);
                Zeroizing::new(hex::encode(generated.as_bytes()).into_bytes())
            }
        };
        Self { store, signing_key }
    }

    async fn record(&self, event: SecurityEvent) -> KmsResult<AuditLogEntry> {
        if let Some(ip) = event.ip_address.as_deref() {
            validate_ip_address(ip)?;
        }
        validate_metadata(&event.metadata)?;

        let mut entry = AuditLogEntry {
            id: format!("audit-{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            event_type: event.event_type,
            tenant_id: event.tenant_id,
            key_id: event.key_id,
            service_id: event.service_id,
            user_id: event.user_id,
            ip_address: event.ip_address,
            action: event.action,
            result: event.result,
            metadata: event.metadata,
            hmac_signature: String::new(),
        };
        entry.hmac_signature = sign(&canonicalize(&entry)?, &self.signing_key)?;

        self.store.append(entry.clone()).await?;
        debug!(
            event_type = %entry.event_type,
            tenant_id = %entry.tenant_id,
            key_id = ?entry.key_id,
            result = %entry.result,
            "Audit entry recorded"
        );
        Ok(entry)
    }

    pub async fn log_key_creation(
        &self,
        key_id: &str,
        tenant_id: &str,
        metadata: Metadata,
    ) -> KmsResult<AuditLogEntry> {
        self.record(
            SecurityEvent::new(AuditEventType::KeyCreated, tenant_id, "create_key")
                .with_key(key_id)
                .with_metadata(metadata),
        )
        .await
    }

    pub async fn log_key_access(
        &self,
        key_id: &str,
        tenant_id: &str,
        service_id: Option<&str>,
    ) -> KmsResult<AuditLogEntry> {
        let mut event = SecurityEvent::new(AuditEventType::KeyAccessed, tenant_id, "access_key")
            .with_key(key_id);
        event.service_id = service_id.map(str::to_string);
        self.record(event).await
    }

    /// Recorded against the new key
    pub async fn log_key_rotation(
        &self,
        old_key_id: &str,
        new_key_id: &str,
        tenant_id: &str,
    ) -> KmsResult<AuditLogEntry> {
        self.record(
            SecurityEvent::new(AuditEventType::KeyRotated, tenant_id, "rotate_key")
                .with_key(new_key_id)
                .with_metadata(metadata([("oldKeyId", old_key_id), ("newKeyId", new_key_id)])),
        )
        .await
    }

    pub async fn log_key_status_change(
        &self,
        key_id: &str,
        tenant_id: &str,
        old_status: KeyStatus,
        new_status: KeyStatus,
        reason: Option<&str>,
    ) -> KmsResult<AuditLogEntry> {
        let mut meta = metadata([
            ("oldStatus", old_status.as_str()),
            ("newStatus", new_status.as_str()),
        ]);
        if let Some(reason) = reason {
            meta.insert("reason".to_string(), reason.into());
        }
        self.record(
            SecurityEvent::new(AuditEventType::KeyStatusChanged, tenant_id, "change_status")
                .with_key(key_id)
                .with_metadata(meta),
        )
        .await
    }

    pub async fn log_key_deletion(
        &self,
        key_id: &str,
        tenant_id: &str,
        force: bool,
    ) -> KmsResult<AuditLogEntry> {
        self.record(
            SecurityEvent::new(AuditEventType::KeyDeleted, tenant_id, "delete_key")
                .with_key(key_id)
                .with_metadata(metadata([("force", force)])),
        )
        .await
    }

    pub async fn log_security_event(&self, event: SecurityEvent) -> KmsResult<AuditLogEntry> {
        if event.event_type.is_alert() {
            warn!(
                event_type = %event.event_type,
                tenant_id = %event.tenant_id,
                action = %event.action,
                "Security event logged"
            );
        }
        self.record(event).await
    }

    /// Record a failed operation with the error message and kind
    pub async fn log_failure(
        &self,
        event_type: AuditEventType,
        key_id: Option<&str>,
        tenant_id: &str,
        action: &str,
        error: &KmsError,
    ) -> KmsResult<AuditLogEntry> {
        let mut event = SecurityEvent::new(event_type, tenant_id, action)
            .failed()
            .with_metadata(metadata([
                ("error", error.to_string()),
                ("errorType", error.kind().to_string()),
            ]));
        event.key_id = key_id.map(str::to_string);
        self.record(event).await
    }

    /// `true` only if the entry's signature matches all of its fields
    pub fn verify_log_entry(&self, entry: &AuditLogEntry) -> bool {
        match canonicalize(entry) {
            Ok(canonical) => verify_signature(&canonical, &self.signing_key, &entry.hmac_signature),
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Failed to canonicalize audit entry");
                false
            }
        }
    }

    /// Matching entries, newest first
    pub async fn query_audit_log(&self, filter: &AuditFilter) -> KmsResult<Vec<AuditLogEntry>> {
        let mut filter = filter.clone();
        filter.limit = Some(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT));
        self.store.query(&filter).await
    }

    /// Verify every stored entry, optionally for one tenant
    pub async fn verify_all(&self, tenant_id: Option<&str>) -> KmsResult<AuditVerification> {
        let filter = AuditFilter {
            tenant_id: tenant_id.map(str::to_string),
            ..AuditFilter::default()
        };
        let entries = self.store.query(&filter).await?;

        let mut report = AuditVerification {
            total: entries.len(),
            ..AuditVerification::default()
        };
        for entry in &entries {
            if self.verify_log_entry(entry) {
                report.valid += 1;
            } else {
                report.invalid_ids.push(entry.id.clone());
            }
        }
        if !report.invalid_ids.is_empty() {
            warn!(invalid = report.invalid_ids.len(), "Audit entries failed verification");
        }
        Ok(report)
    }

    /// Per-type counts; every event type is present, zero if unseen
    pub async fn count_by_event_type(
        &self,
        tenant_id: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> KmsResult<BTreeMap<AuditEventType, usize>> {
        let filter = AuditFilter {
            tenant_id: tenant_id.map(str::to_string),
            start,
            end,
            ..AuditFilter::default()
        };
        let entries = self.store.query(&filter).await?;

        let mut counts: BTreeMap<AuditEventType, usize> =
            AuditEventType::ALL.iter().map(|t| (*t, 0)).collect();
        for entry in &entries {
            *counts.entry(entry.event_type).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Failures and security alerts for a tenant within the trailing window
    pub async fn find_suspicious_activity(
        &self,
        tenant_id: &str,
        window_minutes: i64,
    ) -> KmsResult<Vec<AuditLogEntry>> {
        let filter = AuditFilter {
            tenant_id: Some(tenant_id.to_string()),
            start: Some(Utc::now() - Duration::minutes(window_minutes)),
            ..AuditFilter::default()
        };
        let entries = self.store.query(&filter).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.result == AuditResult::Failure || e.event_type.is_alert())
            .collect())
    }

    /// Delete entries older than the start of the UTC day `retention_days` ago
    pub async fn cleanup_old_logs(&self, retention_days: u32) -> KmsResult<usize> {
        let Some(cutoff_day) = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(u64::from(retention_days)))
        else {
            debug!(retention_days, "Retention window predates the calendar, nothing to clean up");
            return Ok(0);
        };
        let cutoff = Utc.from_utc_datetime(&cutoff_day.and_time(NaiveTime::MIN));

        let removed = self.store.delete_before(cutoff).await?;
        info!(removed, retention_days, cutoff = %cutoff, "Cleaned up old audit entries");
        Ok(removed)
    }

    pub async fn export_logs(&self, filter: &AuditFilter, format: ExportFormat) -> KmsResult<String> {
        let entries = self.query_audit_log(filter).await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&entries)?),
            ExportFormat::Csv => Ok(to_csv(&entries)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_store::MemoryAuditStore;
    use crate::key_types::MetadataValue;

    fn logger() -> (AuditLogger, Arc<MemoryAuditStore>) {
        let store = Arc::new(MemoryAuditStore::new());
        (AuditLogger::new(store.clone(), Some("test-signing-key")), store)
    }

    #[tokio::test]
    async fn test_helpers_record_expected_metadata() {
        let (audit, _) = logger();

        let rotation = audit.log_key_rotation("old", "new", "t1").await.unwrap();
        assert_eq!(rotation.event_type, AuditEventType::KeyRotated);
        assert_eq!(rotation.key_id.as_deref(), Some("new"));
        assert_eq!(rotation.metadata["oldKeyId"], MetadataValue::from("old"));
        assert_eq!(rotation.metadata["newKeyId"], MetadataValue::from("new"));

        let change = audit
            .log_key_status_change("k", "t1", KeyStatus::Active, KeyStatus::Disabled, Some("manual"))
            .await
            .unwrap();
        assert_eq!(change.metadata["oldStatus"], MetadataValue::from("ACTIVE"));
        assert_eq!(change.metadata["newStatus"], MetadataValue::from("DISABLED"));
        assert_eq!(change.metadata["reason"], MetadataValue::from("manual"));

        let deletion = audit.log_key_deletion("k", "t1", true).await.unwrap();
        assert_eq!(deletion.metadata["force"], MetadataValue::Bool(true));

        let access = audit.log_key_access("k", "t1", Some("billing")).await.unwrap();
        assert_eq!(access.service_id.as_deref(), Some("billing"));
        assert!(access.id.starts_with("audit-"));
    }

    #[tokio::test]
    async fn test_log_failure() {
        let (audit, _) = logger();
        let err = KmsError::not_found("k1", "t1");
        let entry = audit
            .log_failure(AuditEventType::KeyAccessed, Some("k1"), "t1", "access_key", &err)
            .await
            .unwrap();

        assert_eq!(entry.result, AuditResult::Failure);
        assert_eq!(entry.metadata["errorType"], MetadataValue::from("KeyNotFoundError"));
        assert!(entry.metadata["error"].to_string().contains("k1"));
    }

    #[tokio::test]
    async fn test_any_field_mutation_breaks_signature() {
        let (audit, _) = logger();
        let entry = audit
            .log_security_event(
                SecurityEvent::new(AuditEventType::UnauthorizedAccess, "t1", "access_key")
                    .with_key("k1")
                    .with_service("svc")
                    .with_user("u1")
                    .with_ip("10.0.0.1")
                    .with_metadata(metadata([("attempts", 3i64)]))
                    .failed(),
            )
            .await
            .unwrap();
        assert!(audit.verify_log_entry(&entry));

        let mutations: Vec<Box<dyn Fn(&mut AuditLogEntry)>> = vec![
            Box::new(|e: &mut AuditLogEntry| e.id.push('x')),
            Box::new(|e: &mut AuditLogEntry| e.timestamp = e.timestamp + Duration::milliseconds(1)),
            Box::new(|e: &mut AuditLogEntry| e.event_type = AuditEventType::KeyAccessed),
            Box::new(|e: &mut AuditLogEntry| e.tenant_id = "t2".to_string()),
            Box::new(|e: &mut AuditLogEntry| e.key_id = None),
            Box::new(|e: &mut AuditLogEntry| e.service_id = Some("other".to_string())),
            Box::new(|e: &mut AuditLogEntry| e.user_id = None),
            Box::new(|e: &mut AuditLogEntry| e.ip_address = Some("10.0.0.2".to_string())),
            Box::new(|e: &mut AuditLogEntry| e.action = "delete_key".to_string()),
            Box::new(|e: &mut AuditLogEntry| e.result = AuditResult::Success),
            Box::new(|e: &mut AuditLogEntry| {
                e.metadata.insert("attempts".to_string(), MetadataValue::Integer(4));
            }),
            Box::new(|e: &mut AuditLogEntry| e.hmac_signature = "00".repeat(32)),
            Box::new(|e: &mut AuditLogEntry| e.hmac_signature = "not-hex".to_string()),
        ];
        for mutate in mutations {
            let mut tampered = entry.clone();
            mutate(&mut tampered);
            assert!(!audit.verify_log_entry(&tampered));
        }
    }

    #[tokio::test]
    async fn test_other_signing_key_rejects() {
        let (audit, store) = logger();
        let entry = audit.log_key_creation("k", "t", Metadata::new()).await.unwrap();
        let other = AuditLogger::new(store, Some("different-key"));
        assert!(!other.verify_log_entry(&entry));
    }

    #[tokio::test]
    async fn test_invalid_ip_rejected() {
        let (audit, _) = logger();
        let result = audit
            .log_security_event(
                SecurityEvent::new(AuditEventType::SecurityAlert, "t", "port_scan").with_ip("999.1.1.1"),
            )
            .await;
        assert!(matches!(result, Err(KmsError::Validation(_))));
    }

    #[tokio::test]
    async fn test_query_newest_first_with_filters() {
        let (audit, _) = logger();
        audit.log_key_creation("k1", "t1", Metadata::new()).await.unwrap();
        audit.log_key_access("k1", "t1", Some("svc-a")).await.unwrap();
        audit.log_key_access("k2", "t1", Some("svc-b")).await.unwrap();
        audit.log_key_creation("k3", "t2", Metadata::new()).await.unwrap();

        let all = audit.query_audit_log(&AuditFilter::for_tenant("t1")).await.unwrap();
        let keys: Vec<_> = all.iter().map(|e| e.key_id.clone().unwrap()).collect();
        assert_eq!(keys, vec!["k2", "k1", "k1"]);

        let by_service = audit
            .query_audit_log(&AuditFilter {
                service_id: Some("svc-a".to_string()),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(by_service.len(), 1);

        let paged = audit
            .query_audit_log(&AuditFilter {
                tenant_id: Some("t1".to_string()),
                limit: Some(1),
                offset: Some(1),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, all[1].id);

        let counts = audit.count_by_event_type(Some("t1"), None, None).await.unwrap();
        assert_eq!(counts[&AuditEventType::KeyCreated], 1);
        assert_eq!(counts[&AuditEventType::KeyAccessed], 2);
        assert_eq!(counts[&AuditEventType::KeyDeleted], 0);
        assert_eq!(counts.len(), AuditEventType::ALL.len());
    }

    #[tokio::test]
    async fn test_find_suspicious_activity() {
        let (audit, _) = logger();
        audit.log_key_access("k1", "t1", None).await.unwrap();
        audit
            .log_failure(
                AuditEventType::KeyAccessed,
                Some("k1"),
                "t1",
                "access_key",
                &KmsError::KeyDisabled("k1".to_string()),
            )
            .await
            .unwrap();
        audit
            .log_security_event(SecurityEvent::new(AuditEventType::SecurityAlert, "t1", "alert"))
            .await
            .unwrap();
        audit
            .log_security_event(SecurityEvent::new(AuditEventType::SecurityAlert, "t2", "alert"))
            .await
            .unwrap();

        let suspicious = audit.find_suspicious_activity("t1", 60).await.unwrap();
        assert_eq!(suspicious.len(), 2);
        assert_eq!(suspicious[0].event_type, AuditEventType::SecurityAlert);
        assert_eq!(suspicious[1].result, AuditResult::Failure);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_today() {
        let (audit, store) = logger();
        audit.log_key_creation("k1", "t1", Metadata::new()).await.unwrap();

        let mut old = audit.log_key_creation("k0", "t1", Metadata::new()).await.unwrap();
        old.id = "audit-old".to_string();
        old.timestamp = Utc::now() - Duration::days(3);
        store.append(old).await.unwrap();

        assert_eq!(audit.cleanup_old_logs(5).await.unwrap(), 0);
        assert_eq!(audit.cleanup_old_logs(0).await.unwrap(), 1);
        let remaining = audit.query_audit_log(&AuditFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| e.id != "audit-old"));
    }

    #[tokio::test]
    async fn test_non_finite_metadata_is_not_recorded() {
        let (audit, store) = logger();
        let err = audit
            .log_security_event(
                SecurityEvent::new(AuditEventType::SecurityAlert, "t1", "anomaly")
                    .with_metadata(metadata([("score", f64::NAN)])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KmsError::Validation(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_with_huge_retention_keeps_everything() {
        let (audit, store) = logger();
        let mut old = audit.log_key_creation("k0", "t1", Metadata::new()).await.unwrap();
        old.id = "audit-old".to_string();
        old.timestamp = Utc::now() - Duration::days(4000);
        store.append(old).await.unwrap();

        assert_eq!(audit.cleanup_old_logs(u32::MAX).await.unwrap(), 0);
        assert_eq!(audit.cleanup_old_logs(36_500).await.unwrap(), 0);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_export_formats() {
        let (audit, _) = logger();
        audit.log_key_access("k1", "t1", Some("svc")).await.unwrap();
        audit
            .log_security_event(SecurityEvent::new(AuditEventType::SecurityAlert, "t1", "odd, \"quoted\""))
            .await
            .unwrap();

        let json = audit
            .export_logs(&AuditFilter::for_tenant("t1"), ExportFormat::Json)
            .await
            .unwrap();
        let parsed: Vec<AuditLogEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.iter().all(|e| audit.verify_log_entry(e)));

        let csv = audit
            .export_logs(&AuditFilter::for_tenant("t1"), ExportFormat::Csv)
            .await
            .unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("SECURITY_ALERT,,t1,\"odd, \"\"quoted\"\"\",success,,"));
        assert!(lines[2].ends_with("KEY_ACCESSED,k1,t1,access_key,success,svc,"));
    }

    #[tokio::test]
    async fn test_verify_all() {
        let (audit, store) = logger();
        audit.log_key_creation("k1", "t1", Metadata::new()).await.unwrap();
        let mut forged = audit.log_key_creation("k2", "t1", Metadata::new()).await.unwrap();
        forged.id = "audit-forged".to_string();
        store.append(forged).await.unwrap();

        let report = audit.verify_all(Some("t1")).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.valid, 2);
        assert_eq!(report.invalid_ids, vec!["audit-forged".to_string()]);
    }

    #[test]
    fn test_export_format_names() {
        assert_eq!(ExportFormat::from_name("CSV"), Some(ExportFormat::Csv));
        assert_eq!(ExportFormat::from_name("json"), Some(ExportFormat::Json));
        assert_eq!(ExportFormat::from_name("xml"), None);
    }
}
