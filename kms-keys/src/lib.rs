//! Multi-tenant key management
//!
//! Envelope encryption of per-tenant data keys under a master key, with
//! a TTL cache, an HMAC-signed audit trail and scheduled rotation.
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


pub mod alerts;
pub mod audit;
pub mod audit_store;
pub mod cache;
pub mod crypto;
pub mod error;
pub mod health;
pub mod key_cache;
pub mod key_types;
pub mod local_store;
mod locks;
pub mod master_key;
pub mod rotation;
pub mod service;
pub mod storage;
pub mod validation;

pub use alerts::{Alert, AlertHandler, AlertManager, AlertSeverity, AlertStats};
pub use audit::{
    AuditEventType, AuditFilter, AuditLogEntry, AuditLogger, AuditResult, AuditVerification,
    ExportFormat, SecurityEvent,
};
pub use audit_store::{AuditStore, MemoryAuditStore};
pub use cache::{CacheBackend, MemoryCache};
pub use error::{ErrorCode, KmsError, KmsResult};
pub use health::{HealthStatus, OverallStatus};
pub use key_cache::{CacheStats, KeyCacheManager};
pub use key_types::{
    DecryptedKey, EncryptedKeyData, KeyFilter, KeyId, KeyMaterial, KeyMetadata, KeyPurpose,
    KeyStatus, Metadata, MetadataValue, StatusCounts, TenantId,
};
pub use local_store::LocalKeyStorage;
pub use master_key::{MasterKey, MasterKeyInfo, MasterKeyManager};
pub use rotation::{
    DataReference, KeyRotationManager, MemoryScheduleStore, ReEncryptor, RotationReport,
    RotationSchedule, RotationStats, ScheduleStore,
};
pub use service::{CreateKeyOptions, KeyManagementService, ServiceSettings};
pub use storage::{KeyStorage, StatusUpdate};
