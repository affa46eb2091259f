//! Configuration management for the key management service

use serde::Deserialize;
use std::env;
use std::fmt;
use thiserror::Error;

/// Environment variable holding the hex-encoded master key
pub const MASTER_KEY_ENV: &str = "MASTER_ENCRYPTION_KEY";

/// Environment variable holding the audit log HMAC signing secret
pub const AUDIT_HMAC_KEY_ENV: &str = "KMS_AUDIT_HMAC_KEY";

/// Longest allowed cache TTL (one day)
pub const MAX_CACHE_TTL_SECS: u64 = 86_400;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

/// Tunables read from `KMS_`-prefixed environment variables
#[derive(Debug, Clone, Deserialize)]
struct KmsSettings {
    cache_ttl_secs: u64,
    audit_retention_days: u32,
    suspicious_window_minutes: u32,
    key_storage_path: Option<String>,
    audit_hmac_key: Option<String>,
}

/// Key management service configuration
#[derive(Clone)]
pub struct KmsConfig {
    /// Hex-encoded master key (64 hex characters)
    pub master_key_hex: Option<String>,
    /// Secret used to sign audit log entries
    pub audit_hmac_key: Option<String>,
    /// Default TTL for decrypted keys in the cache
    pub cache_ttl_secs: u64,
    /// Audit log retention in days
    pub audit_retention_days: u32,
    /// Trailing window used when looking for suspicious activity
    pub suspicious_window_minutes: u32,
    /// Directory for persisted key records (memory-only when unset)
    pub key_storage_path: Option<String>,
    pub log_level: Option<String>,
}

impl KmsConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let settings: KmsSettings = config::Config::builder()
            .set_default("cache_ttl_secs", 300)?
            .set_default("audit_retention_days", 2555)?
            .set_default("suspicious_window_minutes", 60)?
            .add_source(
                config::Environment::with_prefix("KMS")
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let config = Self {
            master_key_hex: env::var(MASTER_KEY_ENV).ok(),
            audit_hmac_key: settings.audit_hmac_key,
            cache_ttl_secs: settings.cache_ttl_secs,
            audit_retention_days: settings.audit_retention_days,
            suspicious_window_minutes: settings.suspicious_window_minutes,
            key_storage_path: settings.key_storage_path,
            log_level: Some(log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl_secs == 0 || self.cache_ttl_secs > MAX_CACHE_TTL_SECS {
            return Err(ConfigError::Invalid(format!(
                "KMS_CACHE_TTL_SECS must be between 1 and {}",
                MAX_CACHE_TTL_SECS
            )));
        }
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            master_key_hex: None,
            audit_hmac_key: None,
            cache_ttl_secs: 300,
            audit_retention_days: 2555,
            suspicious_window_minutes: 60,
            key_storage_path: None,
            log_level: Some("info".to_string()),
        }
    }
}

impl fmt::Debug for KmsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("KmsConfig")
            .field("master_key_hex", &redact(&self.master_key_hex))
            .field("audit_hmac_key", &redact(&self.audit_hmac_key))
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("audit_retention_days", &self.audit_retention_days)
            .field("suspicious_window_minutes", &self.suspicious_window_minutes)
            .field("key_storage_path", &self.key_storage_path)
            .field("log_level", &self.log_level)
            .finish()
    }
}
