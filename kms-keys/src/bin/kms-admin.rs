//! Key management admin tool
//!
//! Usage:
//!   kms-admin generate-master-key
//!   kms-admin master-key-info
//!   kms-admin health
//!   kms-admin rotate-due
//!   kms-admin list-keys <tenant>
//!   kms-admin verify-keys <tenant>
//!
//! Reads the same environment as the service (`MASTER_ENCRYPTION_KEY`,
//! `KMS_KEY_STORAGE_PATH`, ...).
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


use anyhow::{bail, Context};
use kms_config::KmsConfig;
use kms_keys::{KeyFilter, KeyManagementService, MasterKeyManager, OverallStatus};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");

    if command == "generate-master-key" {
        // Printed alone so it can be piped into a secret store
        println!("{}", MasterKeyManager::generate_master_key());
        return Ok(());
    }
    if command == "help" || command == "--help" {
        print_usage();
        return Ok(());
    }

    let config = KmsConfig::from_env().context("failed to load configuration")?;
    kms_logging::init_console_logging("kms-admin", config.log_level());

    match command {
        "master-key-info" => {
            let manager = MasterKeyManager::new(config.master_key_hex.as_deref())?;
            let info = manager.get_master_key_info();
            println!("🔐 Master Key");
            println!("{}", "=".repeat(50));
            println!("  Algorithm:   {}", info.algorithm);
            println!("  Length:      {} bytes", info.length);
            println!("  Fingerprint: {}", manager.get_master_key().fingerprint());
            println!(
                "  Valid:       {}",
                if info.is_valid { "✅ yes" } else { "❌ no" }
            );
        }
        "health" => {
            let kms = KeyManagementService::from_config(&config).await?;
            let health = kms.get_health_status().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if health.status == OverallStatus::Unhealthy {
                bail!("key management service is unhealthy");
            }
        }
        "rotate-due" => {
            let kms = KeyManagementService::from_config(&config).await?;
            let report = kms.run_scheduled_rotations().await?;

            println!("🔄 Rotation sweep");
            println!("{}", "=".repeat(50));
            for replacement in &report.replacements {
                println!(
                    "  ✅ {} -> {} (v{}, tenant {})",
                    replacement.old_key_id,
                    replacement.new_key_id,
                    replacement.new_version,
                    replacement.tenant_id
                );
            }
            for failed in report
                .rotation
                .failed_keys
                .iter()
                .chain(&report.replacement_failures)
            {
                println!("  ❌ {} (tenant {}): {}", failed.key_id, failed.tenant_id, failed.reason);
            }
            println!();
            println!("  Rotated: {}", report.replacements.len());
            println!(
                "  Failed:  {}",
                report.rotation.failed_keys.len() + report.replacement_failures.len()
            );
            println!("  Took:    {} ms", report.rotation.duration_ms);
        }
        "list-keys" => {
            let tenant = tenant_arg(&args)?;
            let kms = KeyManagementService::from_config(&config).await?;
            let keys = kms
                .list_keys(tenant, &KeyFilter { limit: Some(1000), ..KeyFilter::default() })
                .await?;

            println!("🔑 Keys for tenant {}", tenant);
            println!("{}", "=".repeat(50));
            for key in &keys {
                println!(
                    "  {}  v{:<3} {:<20} {}",
                    key.id, key.version, key.purpose, key.status
                );
            }
            println!();
            println!("  Total: {}", keys.len());
        }
        "verify-keys" => {
            let tenant = tenant_arg(&args)?;
            let kms = KeyManagementService::from_config(&config).await?;
            let keys = kms
                .list_keys(tenant, &KeyFilter { limit: Some(1000), ..KeyFilter::default() })
                .await?;

            println!("🔍 Verifying {} key(s) for tenant {}", keys.len(), tenant);
            println!("{}", "=".repeat(50));
            let mut failed = 0;
            for key in &keys {
                if kms.validate_key_integrity(&key.id, tenant).await {
                    println!("  ✅ {}", key.id);
                } else {
                    println!("  ❌ {}", key.id);
                    failed += 1;
                }
            }
            println!();
            println!("  Valid:  {}", keys.len() - failed);
            println!("  Failed: {}", failed);
            if failed > 0 {
                bail!("{} key(s) failed integrity verification", failed);
            }
        }
        other => {
            print_usage();
            bail!("unknown command: {}", other);
        }
    }

    Ok(())
}

fn tenant_arg(args: &[String]) -> anyhow::Result<&str> {
    args.get(1)
        .map(String::as_str)
        .context("missing <tenant> argument")
}

fn print_usage() {
    println!("Usage: kms-admin <command>");
    println!();
    println!("Commands:");
    println!("  generate-master-key     Print a new random master key (hex)");
    println!("  master-key-info         Show the configured master key's fingerprint");
    println!("  health                  Run all health checks");
    println!("  rotate-due              Rotate scheduled and expired keys");
    println!("  list-keys <tenant>      List a tenant's keys");
    println!("  verify-keys <tenant>    Decrypt every key of a tenant to check integrity");
}
