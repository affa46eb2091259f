//! Master key ownership: loading, validation and in-memory rotation
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
use crate::key_types::DEFAULT_ALGORITHM;
use kms_config::MASTER_KEY_ENV;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Master key length in bytes (AES-256)
pub const MASTER_KEY_LEN: usize = 32;

/// Keys with fewer distinct byte values than this are treated as weak
const MIN_DISTINCT_BYTES: usize = 4;

/// The 256-bit root secret. Cloneable, zeroized on drop, never printed or serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey(Zeroizing<[u8; MASTER_KEY_LEN]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.0
    }

    pub fn len(&self) -> usize {
        MASTER_KEY_LEN
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Short, non-reversible identifier for log lines
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.as_bytes());
        hex::encode(&digest[..8])
    }

    fn is_weak(&self) -> bool {
        let distinct: HashSet<u8> = self.as_bytes().iter().copied().collect();
        distinct.len() < MIN_DISTINCT_BYTES
    }

    fn parse_hex(hex_key: &str) -> KmsResult<Self> {
        let hex_key = hex_key.trim();
        if hex_key.is_empty() {
            return Err(KmsError::MasterKey("master key is empty".to_string()));
        }
        if !hex_key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KmsError::MasterKey(
                "master key must be a hexadecimal string".to_string(),
            ));
        }
        if hex_key.len() != MASTER_KEY_LEN * 2 {
            return Err(KmsError::MasterKey(format!(
                "master key must be {} bytes ({} hex characters), got {} hex characters",
                MASTER_KEY_LEN,
                MASTER_KEY_LEN * 2,
                hex_key.len()
            )));
        }

        let mut bytes = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        hex::decode_to_slice(hex_key, bytes.as_mut_slice())
            .map_err(|e| KmsError::MasterKey(format!("master key is not valid hex: {}", e)))?;
        Ok(Self::from_bytes(*bytes))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Non-secret description of the current master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyInfo {
    pub length: usize,
    pub algorithm: &'static str,
    pub is_valid: bool,
}

/// Owns the root secret that wraps every tenant key
pub struct MasterKeyManager {
    key: RwLock<MasterKey>,
}

impl MasterKeyManager {
    /// Load the master key from `MASTER_ENCRYPTION_KEY`
    pub fn from_env() -> KmsResult<Self> {
        let value = std::env::var(MASTER_KEY_ENV).ok();
        Self::new(value.as_deref())
    }

    /// Build from an optional hex secret, failing fast when absent or malformed
    pub fn new(hex_key: Option<&str>) -> KmsResult<Self> {
        let hex_key = hex_key.ok_or_else(|| {
            KmsError::MasterKey(format!("{} is not set", MASTER_KEY_ENV))
        })?;
        Self::from_hex(hex_key)
    }

    pub fn from_hex(hex_key: &str) -> KmsResult<Self> {
        let key = MasterKey::parse_hex(hex_key)?;
        if key.is_weak() {
            warn!("Loaded master key looks weak; validate_master_key() will report it as invalid");
        }
        info!(fingerprint = %key.fingerprint(), "Master key loaded");
        Ok(Self {
            key: RwLock::new(key),
        })
    }

    /// Generate a random master key as 64 hex characters
    pub fn generate_master_key() -> String {
        let material = crate::key_types::KeyMaterial::generate(MASTER_KEY_LEN);
        hex::encode(material.as_bytes())
    }

    /// Current master key
    pub fn get_master_key(&self) -> MasterKey {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `false` for obviously weak material such as an all-zero key
    pub fn validate_master_key(&self) -> bool {
        !self.get_master_key().is_weak()
    }

    /// Swap the in-memory master key, returning the previous one.
    ///
    /// Existing wrapped keys are not touched; re-wrapping them is a separate
    /// administrative step (`KeyManagementService::rewrap_keys`).
    pub fn rotate_master_key(&self, new_hex: &str) -> KmsResult<MasterKey> {
        let new_key = MasterKey::parse_hex(new_hex)?;
        if new_key.is_weak() {
            return Err(KmsError::MasterKey(
                "new master key is too weak".to_string(),
            ));
        }

        let mut guard = self.key.write().unwrap_or_else(PoisonError::into_inner);
        if *guard == new_key {
            return Err(KmsError::MasterKey(
                "new master key must differ from the current master key".to_string(),
            ));
        }

        let previous = std::mem::replace(&mut *guard, new_key);
        info!(
            previous = %previous.fingerprint(),
            current = %guard.fingerprint(),
            "Master key rotated"
        );
        Ok(previous)
    }

    pub fn get_master_key_info(&self) -> MasterKeyInfo {
        MasterKeyInfo {
            length: MASTER_KEY_LEN,
            algorithm: DEFAULT_ALGORITHM,
            is_valid: self.validate_master_key(),
        }
    }
}

impl fmt::Debug for MasterKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyManager")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
