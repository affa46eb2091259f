//! Key type definitions
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

/// Unique identifier for a key
pub type KeyId = String;

/// Tenant identifier
pub type TenantId = String;

/// Default wrapping and data-key algorithm
pub const DEFAULT_ALGORITHM: &str = "aes-256-gcm";

/// Size of generated data keys in bytes
pub const DATA_KEY_LEN: usize = 32;

/// Default page size for listings
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Intended usage of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyPurpose {
    /// Generic data at rest
    DataEncryption,
    /// Whole-document encryption
    DocumentEncryption,
    /// Column / field level encryption
    FieldEncryption,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 3] = [
        KeyPurpose::DataEncryption,
        KeyPurpose::DocumentEncryption,
        KeyPurpose::FieldEncryption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::DataEncryption => "DATA_ENCRYPTION",
            KeyPurpose::DocumentEncryption => "DOCUMENT_ENCRYPTION",
            KeyPurpose::FieldEncryption => "FIELD_ENCRYPTION",
        }
    }

    /// Get default rotation period in days for this purpose
    pub fn default_rotation_period_days(&self) -> u32 {
        match self {
            KeyPurpose::DataEncryption => 365,
            KeyPurpose::DocumentEncryption => 365,
            KeyPurpose::FieldEncryption => 180,
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    /// Usable for new encryption
    Active,
    /// Superseded by a newer version, still decryptable
    Deprecated,
    /// Administratively paused
    Disabled,
    /// Terminal, flagged by a security incident
    Compromised,
}

impl KeyStatus {
    pub const ALL: [KeyStatus; 4] = [
        KeyStatus::Active,
        KeyStatus::Deprecated,
        KeyStatus::Disabled,
        KeyStatus::Compromised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "ACTIVE",
            KeyStatus::Deprecated => "DEPRECATED",
            KeyStatus::Disabled => "DISABLED",
            KeyStatus::Compromised => "COMPROMISED",
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: KeyStatus) -> bool {
        use KeyStatus::*;
        match (self, next) {
            (Compromised, _) => false,
            (_, Compromised) => true,
            (Active, Deprecated) | (Active, Disabled) => true,
            (Deprecated, Active) | (Deprecated, Disabled) => true,
            (Disabled, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metadata value: a closed set of scalars and lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<MetadataValue>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// `false` for NaN or infinite floats, which JSON cannot carry
    pub fn is_finite(&self) -> bool {
        match self {
            MetadataValue::Float(x) => x.is_finite(),
            MetadataValue::List(items) => items.iter().all(MetadataValue::is_finite),
            _ => true,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Integer(i) => write!(f, "{}", i),
            MetadataValue::Float(x) => write!(f, "{}", x),
            MetadataValue::Text(s) => f.write_str(s),
            MetadataValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Integer(v)
    }
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        MetadataValue::Integer(i64::from(v))
    }
}

impl From<usize> for MetadataValue {
    fn from(v: usize) -> Self {
        MetadataValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Text(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Text(v)
    }
}

impl<T: Into<MetadataValue>> From<Vec<T>> for MetadataValue {
    fn from(v: Vec<T>) -> Self {
        MetadataValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Opaque key/value metadata with a stable (sorted) key order
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Build a metadata map from `(key, value)` pairs
pub fn metadata<K, V, I>(pairs: I) -> Metadata
where
    K: Into<String>,
    V: Into<MetadataValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Raw key bytes, zeroized on drop and never printed
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Zeroizing<Vec<u8>>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Generate fresh random key material
    pub fn generate(len: usize) -> Self {
        use rand::RngCore;
        let mut bytes = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED; {} bytes])", self.0.len())
    }
}

// Cache entries carry the material hex-encoded.
impl Serialize for KeyMaterial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(hex::encode(self.as_bytes()));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for KeyMaterial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        hex::decode(encoded.as_str())
            .map(KeyMaterial::new)
            .map_err(serde::de::Error::custom)
    }
}

/// A persisted, master-key-wrapped key record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyData {
    pub id: KeyId,
    pub tenant_id: TenantId,
    pub purpose: KeyPurpose,
    pub algorithm: String,
    /// Hex-encoded ciphertext of the data key
    pub encrypted_key: String,
    /// Hex-encoded 96-bit IV
    pub iv: String,
    /// Hex-encoded 128-bit GCM tag
    pub auth_tag: String,
    pub version: u32,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl EncryptedKeyData {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Key record without any key material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub id: KeyId,
    pub tenant_id: TenantId,
    pub purpose: KeyPurpose,
    pub algorithm: String,
    pub version: u32,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl From<&EncryptedKeyData> for KeyMetadata {
    fn from(record: &EncryptedKeyData) -> Self {
        Self {
            id: record.id.clone(),
            tenant_id: record.tenant_id.clone(),
            purpose: record.purpose,
            algorithm: record.algorithm.clone(),
            version: record.version,
            status: record.status,
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
            last_used_at: record.last_used_at,
            metadata: record.metadata.clone(),
        }
    }
}

/// An unwrapped key, as handed to callers and held in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedKey {
    pub id: KeyId,
    pub tenant_id: TenantId,
    pub purpose: KeyPurpose,
    pub algorithm: String,
    pub version: u32,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub key: KeyMaterial,
}

impl DecryptedKey {
    pub fn from_record(record: &EncryptedKeyData, key: KeyMaterial) -> Self {
        Self {
            id: record.id.clone(),
            tenant_id: record.tenant_id.clone(),
            purpose: record.purpose,
            algorithm: record.algorithm.clone(),
            version: record.version,
            status: record.status,
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
            key,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// Filter for key listings
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub status: Option<KeyStatus>,
    pub purpose: Option<KeyPurpose>,
    pub expires_after: Option<DateTime<Utc>>,
    pub expires_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl KeyFilter {
    pub fn with_status(status: KeyStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &EncryptedKeyData) -> bool {
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.purpose.is_some_and(|p| p != record.purpose) {
            return false;
        }
        if let Some(after) = self.expires_after {
            if !matches!(record.expires_at, Some(e) if e >= after) {
                return false;
            }
        }
        if let Some(before) = self.expires_before {
            if !matches!(record.expires_at, Some(e) if e <= before) {
                return false;
            }
        }
        true
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT)
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

/// Number of keys per status for one tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub active: usize,
    pub deprecated: usize,
    pub disabled: usize,
    pub compromised: usize,
}

impl StatusCounts {
    pub fn increment(&mut self, status: KeyStatus) {
        match status {
            KeyStatus::Active => self.active += 1,
            KeyStatus::Deprecated => self.deprecated += 1,
            KeyStatus::Disabled => self.disabled += 1,
            KeyStatus::Compromised => self.compromised += 1,
        }
    }

    pub fn get(&self, status: KeyStatus) -> usize {
        match status {
            KeyStatus::Active => self.active,
            KeyStatus::Deprecated => self.deprecated,
            KeyStatus::Disabled => self.disabled,
            KeyStatus::Compromised => self.compromised,
        }
    }

    pub fn total(&self) -> usize {
        self.active + self.deprecated + self.disabled + self.compromised
    }
}
