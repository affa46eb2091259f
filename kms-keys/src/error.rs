//! Error types for key management
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


use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MasterKeyError,
    KeyNotFound,
    KeyDisabled,
    KeyCompromised,
    KeyExpired,
    InvalidStatusTransition,
    RotationFailed,
    EncryptionFailed,
    CacheError,
    AuditLogError,
    StorageError,
    InvalidInput,
    ConfigurationError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MasterKeyError => "MASTER_KEY_ERROR",
            ErrorCode::KeyNotFound => "KEY_NOT_FOUND",
            ErrorCode::KeyDisabled => "KEY_DISABLED",
            ErrorCode::KeyCompromised => "KEY_COMPROMISED",
            ErrorCode::KeyExpired => "KEY_EXPIRED",
            ErrorCode::InvalidStatusTransition => "INVALID_STATUS_TRANSITION",
            ErrorCode::RotationFailed => "ROTATION_FAILED",
            ErrorCode::EncryptionFailed => "ENCRYPTION_FAILED",
            ErrorCode::CacheError => "CACHE_ERROR",
            ErrorCode::AuditLogError => "AUDIT_LOG_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key management errors
#[derive(Error, Debug)]
pub enum KmsError {
    #[error("Master key error: {0}")]
    MasterKey(String),

    #[error("Key not found: {key_id} (tenant {tenant_id})")]
    KeyNotFound { key_id: String, tenant_id: String },

    #[error("Key is disabled: {0}")]
    KeyDisabled(String),

    #[error("Key is compromised: {0}")]
    KeyCompromised(String),

    #[error("Key has expired: {0}")]
    KeyExpired(String),

    #[error("Invalid status transition: {0}")]
    InvalidStatusTransition(String),

    #[error("Re-encryption partially failed: {failed}/{total} records failed")]
    ReEncryptionPartialFailure {
        failed: usize,
        total: usize,
        failures: Vec<String>,
    },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Audit log error: {0}")]
    AuditLog(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KmsError {
    pub fn not_found(key_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        KmsError::KeyNotFound {
            key_id: key_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Machine-readable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            KmsError::MasterKey(_) => ErrorCode::MasterKeyError,
            KmsError::KeyNotFound { .. } => ErrorCode::KeyNotFound,
            KmsError::KeyDisabled(_) => ErrorCode::KeyDisabled,
            KmsError::KeyCompromised(_) => ErrorCode::KeyCompromised,
            KmsError::KeyExpired(_) => ErrorCode::KeyExpired,
            KmsError::InvalidStatusTransition(_) => ErrorCode::InvalidStatusTransition,
            KmsError::ReEncryptionPartialFailure { .. } => ErrorCode::RotationFailed,
            KmsError::Encryption(_) | KmsError::Decryption(_) => ErrorCode::EncryptionFailed,
            KmsError::Storage(_) | KmsError::Io(_) | KmsError::Serialization(_) => {
                ErrorCode::StorageError
            }
            KmsError::Cache(_) => ErrorCode::CacheError,
            KmsError::AuditLog(_) => ErrorCode::AuditLogError,
            KmsError::Validation(_) => ErrorCode::InvalidInput,
            KmsError::Configuration(_) => ErrorCode::ConfigurationError,
        }
    }

    /// Short type name recorded in audit metadata
    pub fn kind(&self) -> &'static str {
        match self {
            KmsError::MasterKey(_) => "MasterKeyError",
            KmsError::KeyNotFound { .. } => "KeyNotFoundError",
            KmsError::KeyDisabled(_) => "KeyDisabledError",
            KmsError::KeyCompromised(_) => "KeyCompromisedError",
            KmsError::KeyExpired(_) => "KeyExpiredError",
            KmsError::InvalidStatusTransition(_) => "InvalidStatusTransitionError",
            KmsError::ReEncryptionPartialFailure { .. } => "ReEncryptionPartialFailureError",
            _ => "KeyManagementError",
        }
    }
}

/// Result type for key operations
pub type KmsResult<T> = Result<T, KmsError>;
