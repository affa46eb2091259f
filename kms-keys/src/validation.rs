//! Identifier validation
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
use crate::key_types::Metadata;
use std::net::IpAddr;

const MAX_TENANT_ID_LEN: usize = 64;
const MAX_KEY_ID_LEN: usize = 128;
const MAX_PRINCIPAL_ID_LEN: usize = 64;

fn validate_token(kind: &str, value: &str, max_len: usize) -> KmsResult<()> {
    if value.is_empty() || value.len() > max_len {
        return Err(KmsError::Validation(format!(
            "{} must be 1-{} characters",
            kind, max_len
        )));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(KmsError::Validation(format!(
            "{} may only contain letters, digits, '_' and '-'",
            kind
        )));
    }
    Ok(())
}

/// Tenant ids double as directory names in the file-backed store.
pub fn validate_tenant_id(tenant_id: &str) -> KmsResult<()> {
    validate_token("tenant id", tenant_id, MAX_TENANT_ID_LEN)
}

pub fn validate_key_id(key_id: &str) -> KmsResult<()> {
    validate_token("key id", key_id, MAX_KEY_ID_LEN)
}

pub fn validate_service_id(service_id: &str) -> KmsResult<()> {
    validate_token("service id", service_id, MAX_PRINCIPAL_ID_LEN)
}

pub fn validate_user_id(user_id: &str) -> KmsResult<()> {
    validate_token("user id", user_id, MAX_PRINCIPAL_ID_LEN)
}

pub fn validate_ip_address(ip: &str) -> KmsResult<()> {
    ip.parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| KmsError::Validation(format!("invalid IP address: {}", ip)))
}

/// Validate a `(key id, tenant id)` pair
pub fn validate_key_ref(key_id: &str, tenant_id: &str) -> KmsResult<()> {
    validate_key_id(key_id)?;
    validate_tenant_id(tenant_id)
}

/// Metadata is signed and persisted as JSON, so every float must be finite
pub fn validate_metadata(metadata: &Metadata) -> KmsResult<()> {
    match metadata.iter().find(|(_, value)| !value.is_finite()) {
        Some((name, _)) => Err(KmsError::Validation(format!(
            "metadata value '{}' must be a finite number",
            name
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_types::{metadata, MetadataValue};

    #[test]
    fn test_metadata_rejects_non_finite_floats() {
        assert!(validate_metadata(&metadata([("ratio", 0.5f64)])).is_ok());
        assert!(validate_metadata(&metadata([("ratio", f64::NAN)])).is_err());
        assert!(validate_metadata(&metadata([("ratio", f64::INFINITY)])).is_err());

        let nested = metadata([(
            "samples",
            MetadataValue::List(vec![MetadataValue::Float(1.0), MetadataValue::Float(f64::NEG_INFINITY)]),
        )]);
        let err = validate_metadata(&nested).unwrap_err();
        assert!(err.to_string().contains("samples"));
    }

    #[test]
    fn test_accepts_well_formed_ids() {
        assert!(validate_tenant_id("tenant-1").is_ok());
        assert!(validate_key_id("9f2c_ab-01").is_ok());
        assert!(validate_service_id("billing_service").is_ok());
        assert!(validate_ip_address("10.0.0.1").is_ok());
        assert!(validate_ip_address("::1").is_ok());
    }

    #[test]
    fn test_rejects_path_like_and_oversized_ids() {
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("../etc").is_err());
        assert!(validate_key_id("a/b").is_err());
        assert!(validate_tenant_id(&"t".repeat(65)).is_err());
        assert!(validate_key_id(&"k".repeat(128)).is_ok());
        assert!(validate_ip_address("999.1.1.1").is_err());
    }

    #[test]
    fn test_validation_error_code() {
        let err = validate_tenant_id("bad tenant").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidInput);
    }
}
