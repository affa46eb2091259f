//! In-process security alerts
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


use crate::key_types::{metadata, Metadata, MetadataValue};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Resolved alerts older than this are dropped by `cleanup_old_alerts`
pub const DEFAULT_ALERT_MAX_AGE_DAYS: i64 = 7;

/// At most this many key ids are attached to an overdue-rotation alert
const MAX_LISTED_KEYS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub const ALL: [AlertSeverity; 4] = [
        AlertSeverity::Info,
        AlertSeverity::Warning,
        AlertSeverity::Error,
        AlertSeverity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStats {
    pub total: usize,
    pub active: usize,
    pub resolved: usize,
    /// Unresolved alerts per severity; every severity is present
    pub by_severity: BTreeMap<AlertSeverity, usize>,
}

/// Callback run for each new alert of the severity it was registered for
pub type AlertHandler = Arc<dyn Fn(&Alert) -> anyhow::Result<()> + Send + Sync>;

/// Keeps raised alerts in memory and fans them out to registered handlers
pub struct AlertManager {
    alerts: RwLock<HashMap<String, Alert>>,
    handlers: RwLock<HashMap<AlertSeverity, Vec<AlertHandler>>>,
    enabled: bool,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::with_enabled(true)
    }

    /// A disabled manager still records alerts but runs no handlers
    pub fn with_enabled(enabled: bool) -> Self {
        Self {
            alerts: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            enabled,
        }
    }

    pub async fn register_handler(&self, severity: AlertSeverity, handler: AlertHandler) {
        self.handlers
            .write()
            .await
            .entry(severity)
            .or_default()
            .push(handler);
    }

    pub async fn create_alert(
        &self,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        metadata: Metadata,
    ) -> Alert {
        let alert = Alert {
            id: format!("alert-{}", uuid::Uuid::new_v4()),
            severity,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            metadata,
            resolved: false,
            resolved_at: None,
        };

        self.alerts
            .write()
            .await
            .insert(alert.id.clone(), alert.clone());

        match severity {
            AlertSeverity::Critical | AlertSeverity::Error => {
                error!(alert_id = %alert.id, severity = %severity, title = %alert.title, "{}", alert.message)
            }
            AlertSeverity::Warning => {
                warn!(alert_id = %alert.id, severity = %severity, title = %alert.title, "{}", alert.message)
            }
            AlertSeverity::Info => {
                info!(alert_id = %alert.id, severity = %severity, title = %alert.title, "{}", alert.message)
            }
        }

        if self.enabled {
            self.run_handlers(&alert).await;
        }
        alert
    }

    async fn run_handlers(&self, alert: &Alert) {
        let handlers = self
            .handlers
            .read()
            .await
            .get(&alert.severity)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            if let Err(e) = handler(alert) {
                error!(alert_id = %alert.id, error = %e, "Alert handler failed");
            }
        }
    }

    /// Returns `false` when the id is unknown
    pub async fn resolve_alert(&self, alert_id: &str) -> bool {
        let mut alerts = self.alerts.write().await;
        match alerts.get_mut(alert_id) {
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(Utc::now());
                info!(alert_id = %alert_id, title = %alert.title, "Alert resolved");
                true
            }
            None => false,
        }
    }

    /// Unresolved alerts, newest first
    pub async fn get_active_alerts(&self) -> Vec<Alert> {
        self.collect_unresolved(|_| true).await
    }

    pub async fn get_alerts_by_severity(&self, severity: AlertSeverity) -> Vec<Alert> {
        self.collect_unresolved(|alert| alert.severity == severity)
            .await
    }

    async fn collect_unresolved(&self, keep: impl Fn(&Alert) -> bool) -> Vec<Alert> {
        let mut active: Vec<Alert> = self
            .alerts
            .read()
            .await
            .values()
            .filter(|alert| !alert.resolved && keep(alert))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        active
    }

    /// Raise an alert for a named security event
    pub async fn handle_security_event(&self, event_type: &str, details: Metadata) -> Alert {
        let detail = |name: &str| {
            details
                .get(name)
                .map(MetadataValue::to_string)
                .unwrap_or_else(|| "unknown".to_string())
        };

        let (severity, title, message) = match event_type {
            "unauthorized_access" => (
                AlertSeverity::Critical,
                "Unauthorized Access Attempt",
                format!(
                    "Unauthorized access attempt for resource {} by user {}",
                    detail("resourceId"),
                    detail("userId")
                ),
            ),
            "rate_limit_exceeded" => {
                let subject = match details.get("userId") {
                    Some(user) => format!("user {}", user),
                    None => format!("IP {}", detail("ipAddress")),
                };
                (
                    AlertSeverity::Error,
                    "Rate Limit Exceeded",
                    format!("Rate limit exceeded for {}", subject),
                )
            }
            "failed_login" => (
                AlertSeverity::Warning,
                "Failed Login Attempt",
                format!("Failed login attempt for user {}", detail("userId")),
            ),
            "suspicious_activity" => (
                AlertSeverity::Error,
                "Suspicious Activity Detected",
                format!("Suspicious activity detected: {}", detail("description")),
            ),
            "data_export" => (
                AlertSeverity::Warning,
                "Data Export Performed",
                format!("Data export performed by user {}", detail("userId")),
            ),
            other => (
                AlertSeverity::Info,
                "Security Event",
                format!("Security event: {}", other),
            ),
        };

        self.create_alert(severity, title, message, details).await
    }

    pub async fn handle_key_compromised(&self, key_id: &str, tenant_id: &str, reason: &str) -> Alert {
        self.create_alert(
            AlertSeverity::Critical,
            "Key Compromised",
            format!("Key {} of tenant {} was marked as compromised", key_id, tenant_id),
            metadata([("keyId", key_id), ("tenantId", tenant_id), ("reason", reason)]),
        )
        .await
    }

    pub async fn handle_key_rotated(&self, old_key_id: &str, new_key_id: &str, tenant_id: &str) -> Alert {
        self.create_alert(
            AlertSeverity::Info,
            "Key Rotated",
            format!("Key {} was replaced by {}", old_key_id, new_key_id),
            metadata([
                ("oldKeyId", old_key_id),
                ("newKeyId", new_key_id),
                ("tenantId", tenant_id),
            ]),
        )
        .await
    }

    pub async fn handle_rotation_error(&self, key_id: &str, tenant_id: &str, error: &str) -> Alert {
        self.create_alert(
            AlertSeverity::Error,
            "Key Rotation Failed",
            format!("Failed to rotate key {}", key_id),
            metadata([("keyId", key_id), ("tenantId", tenant_id), ("error", error)]),
        )
        .await
    }

    /// More than ten overdue keys escalates from warning to error
    pub async fn handle_overdue_rotations(&self, count: usize, key_ids: &[String]) -> Alert {
        let severity = if count > MAX_LISTED_KEYS {
            AlertSeverity::Error
        } else {
            AlertSeverity::Warning
        };
        let listed: Vec<String> = key_ids.iter().take(MAX_LISTED_KEYS).cloned().collect();

        let mut meta = metadata([("count", count), ("totalOverdue", key_ids.len())]);
        meta.insert("keyIds".to_string(), MetadataValue::from(listed));
        self.create_alert(
            severity,
            "Overdue Key Rotations",
            format!("{} keys are overdue for rotation", count),
            meta,
        )
        .await
    }

    pub async fn handle_health_check_failure(&self, component: &str, error: &str) -> Alert {
        self.create_alert(
            AlertSeverity::Critical,
            "Health Check Failed",
            format!("{} health check failed: {}", component, error),
            metadata([("component", component), ("error", error)]),
        )
        .await
    }

    pub async fn handle_performance_issue(&self, metric: &str, value: f64, threshold: f64) -> Alert {
        let mut meta = metadata([("metric", metric)]);
        meta.insert("value".to_string(), MetadataValue::from(value));
        meta.insert("threshold".to_string(), MetadataValue::from(threshold));
        self.create_alert(
            AlertSeverity::Warning,
            "Performance Degradation",
            format!("{} is {}, exceeding threshold of {}", metric, value, threshold),
            meta,
        )
        .await
    }

    /// Drop resolved alerts resolved longer than `max_age` ago. Returns the count removed.
    pub async fn cleanup_old_alerts(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut alerts = self.alerts.write().await;
        let before = alerts.len();
        alerts.retain(|_, alert| {
            !matches!(alert.resolved_at, Some(at) if alert.resolved && now - at > max_age)
        });
        let cleaned = before - alerts.len();

        if cleaned > 0 {
            info!(cleaned, "Cleaned up old alerts");
        }
        cleaned
    }

    pub async fn get_statistics(&self) -> AlertStats {
        let alerts = self.alerts.read().await;
        let mut stats = AlertStats {
            total: alerts.len(),
            by_severity: AlertSeverity::ALL.iter().map(|s| (*s, 0)).collect(),
            ..AlertStats::default()
        };
        for alert in alerts.values() {
            if alert.resolved {
                stats.resolved += 1;
            } else {
                stats.active += 1;
                *stats.by_severity.entry(alert.severity).or_default() += 1;
            }
        }
        stats
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}
