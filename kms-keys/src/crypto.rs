//! Envelope encryption of data keys under the master key
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
use crate::key_types::{EncryptedKeyData, KeyMaterial};
use crate::master_key::MasterKey;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};

/// GCM nonce length in bytes
pub const IV_LEN: usize = 12;

/// GCM tag length in bytes
pub const TAG_LEN: usize = 16;

/// A data key sealed under the master key, hex encoded for storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub encrypted_key: String,
    pub iv: String,
    pub auth_tag: String,
}

impl WrappedKey {
    pub fn from_record(record: &EncryptedKeyData) -> Self {
        Self {
            encrypted_key: record.encrypted_key.clone(),
            iv: record.iv.clone(),
            auth_tag: record.auth_tag.clone(),
        }
    }
}

/// Associated data binding a wrapped key to its owner
pub fn key_aad(tenant_id: &str, key_id: &str) -> Vec<u8> {
    format!("{}:{}", tenant_id, key_id).into_bytes()
}

fn cipher_for(master: &MasterKey) -> KmsResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(master.as_bytes())
        .map_err(|e| KmsError::Encryption(format!("Invalid master key length: {}", e)))
}

/// Encrypt key material with a fresh random IV
pub fn wrap_key(material: &KeyMaterial, master: &MasterKey, aad: &[u8]) -> KmsResult<WrappedKey> {
    let cipher = cipher_for(master)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut sealed = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: material.as_bytes(),
                aad,
            },
        )
        .map_err(|e| KmsError::Encryption(format!("Encryption failed: {}", e)))?;

    // aes-gcm appends the tag to the ciphertext
    if sealed.len() < TAG_LEN {
        return Err(KmsError::Encryption("Ciphertext shorter than tag".to_string()));
    }
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(WrappedKey {
        encrypted_key: hex::encode(&sealed),
        iv: hex::encode(nonce),
        auth_tag: hex::encode(tag),
    })
}

/// Decrypt and authenticate key material
pub fn unwrap_key(wrapped: &WrappedKey, master: &MasterKey, aad: &[u8]) -> KmsResult<KeyMaterial> {
    let decode = |field: &str, value: &str| {
        hex::decode(value)
            .map_err(|e| KmsError::Decryption(format!("Malformed {}: {}", field, e)))
    };
    let mut sealed = decode("encrypted key", &wrapped.encrypted_key)?;
    let iv = decode("iv", &wrapped.iv)?;
    let tag = decode("auth tag", &wrapped.auth_tag)?;

    if iv.len() != IV_LEN {
        return Err(KmsError::Decryption(format!(
            "IV must be {} bytes, got {}",
            IV_LEN,
            iv.len()
        )));
    }
    if tag.len() != TAG_LEN {
        return Err(KmsError::Decryption(format!(
            "Auth tag must be {} bytes, got {}",
            TAG_LEN,
            tag.len()
        )));
    }
    sealed.extend_from_slice(&tag);

    let cipher = cipher_for(master)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|_| KmsError::Decryption("Authentication failed".to_string()))?;

    Ok(KeyMaterial::new(plaintext))
}
