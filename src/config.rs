use crate::error::MigrationError;
use crate::migration::{BatchSettings, FailurePolicy, LockSettings, RateLimitPolicy};
use crate::paths::RehomePaths;
use crate::retry::{RetryPolicy, RetryStrategy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

const DEFAULT_MIGRATION_ID: &str = "legacy-to-dir";

/// Retry settings for transient storage errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub strategy: RetryStrategy,
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: 4,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            jitter_fraction: 0.2,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.strategy,
            self.max_attempts.max(1),
            Duration::from_millis(self.base_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.max_delay_ms))
        .with_jitter(self.jitter_fraction)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Identifies this migration in attempt, journal and checksum records.
    pub migration_id: String,
    /// Key prefix of the migrated namespace; empty migrates every user key.
    pub namespace: String,
    /// Version the marker advances to once the copy is committed.
    pub target_version: u32,
    /// A key whose presence in the legacy store proves legacy data exists.
    pub legacy_probe_key: Option<String>,
    /// Prefixes never copied, snapshotted or cleared, besides the control prefix.
    pub reserved_prefixes: Vec<String>,
    pub lock: LockSettings,
    pub batch: BatchSettings,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitPolicy,
    pub failure: FailurePolicy,
    /// Soft wall-clock budget for one run.
    pub run_budget_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migration_id: DEFAULT_MIGRATION_ID.to_string(),
            namespace: String::new(),
            target_version: 2,
            legacy_probe_key: None,
            reserved_prefixes: Vec::new(),
            lock: LockSettings::default(),
            batch: BatchSettings::default(),
            retry: RetrySettings::default(),
            rate_limit: RateLimitPolicy::default(),
            failure: FailurePolicy::default(),
            run_budget_ms: 10 * 60 * 1_000,
        }
    }
}

impl MigrationConfig {
    pub fn load(paths: &RehomePaths) -> Result<Self> {
        if !paths.config_path.exists() {
            return Ok(MigrationConfig::default());
        }
        let data = fs::read_to_string(&paths.config_path)
            .with_context(|| format!("Failed to read {}", paths.config_path.display()))?;
        let config: MigrationConfig = serde_json::from_str(&data)
            .with_context(|| format!("Invalid config file {}", paths.config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, paths: &RehomePaths) -> Result<()> {
        self.validate()?;
        if let Some(parent) = paths.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&paths.config_path, data)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let perms = Permissions::from_mode(0o600);
            fs::set_permissions(&paths.config_path, perms)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        validate_migration_id(&self.migration_id)?;
        if self.target_version == 0 {
            return Err(invalid("target_version must be at least 1"));
        }
        if self.namespace.starts_with(crate::storage::CONTROL_PREFIX) {
            return Err(invalid("namespace cannot be inside the control prefix"));
        }
        if self.lock.ttl_ms == 0 {
            return Err(invalid("lock.ttl_ms must be positive"));
        }
        if self.lock.settle_delay_ms >= self.lock.ttl_ms {
            return Err(invalid("lock.settle_delay_ms must be shorter than lock.ttl_ms"));
        }
        if !(0.0..=1.0).contains(&self.lock.jitter_fraction) {
            return Err(invalid("lock.jitter_fraction must be within 0..=1"));
        }
        self.batch.validate().map_err(MigrationError::InvalidConfig)?;
        if self.rate_limit.max_attempts == 0 {
            return Err(invalid("rate_limit.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failure.max_failed_ratio) {
            return Err(invalid("failure.max_failed_ratio must be within 0..=1"));
        }
        if self.run_budget_ms == 0 {
            return Err(invalid("run_budget_ms must be positive"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> MigrationError {
    MigrationError::InvalidConfig(reason.to_string())
}

fn validate_migration_id(id: &str) -> Result<(), MigrationError> {
    if id.is_empty() || id.len() > 64 {
        return Err(invalid("migration_id must be 1 to 64 characters"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(invalid("migration_id contains invalid characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MigrationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rate_limit.failure_threshold, 3);
        assert_eq!(config.retry.policy().max_attempts(), 4);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RehomePaths::new(Some(dir.path()), None).unwrap();
        fs::write(
            &paths.config_path,
            r#"{"namespace":"app/","lock":{"ttl_ms":60000}}"#,
        )
        .unwrap();

        let config = MigrationConfig::load(&paths).unwrap();
        assert_eq!(config.namespace, "app/");
        assert_eq!(config.lock.ttl_ms, 60_000);
        assert_eq!(config.lock.settle_delay_ms, 150);
        assert_eq!(config.migration_id, DEFAULT_MIGRATION_ID);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RehomePaths::new(Some(dir.path()), None).unwrap();
        let config = MigrationConfig {
            target_version: 5,
            ..MigrationConfig::default()
        };
        config.save(&paths).unwrap();
        assert_eq!(MigrationConfig::load(&paths).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = MigrationConfig {
            migration_id: "../escape".into(),
            ..MigrationConfig::default()
        };
        assert!(config.validate().is_err());

        config.migration_id = "ok".into();
        config.lock.settle_delay_ms = config.lock.ttl_ms;
        assert!(matches!(
            config.validate(),
            Err(MigrationError::InvalidConfig(_))
        ));
    }
}
