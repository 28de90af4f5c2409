//! Pool configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use crate::error::PoolError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry policies per call family
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Environment creation (slow, rate-limited)
    pub provision: RetryPolicy,
    /// Record queries and keyed updates
    pub records: RetryPolicy,
    /// Polling for freshly written records to become queryable
    pub visibility: RetryPolicy,
    /// Notification dispatch
    pub notify: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            provision: RetryPolicy::fixed(3, Duration::from_secs(30)),
            records: RetryPolicy::fixed(3, Duration::from_secs(3)),
            visibility: RetryPolicy::exponential(
                3,
                Duration::from_secs(3),
                2.0,
                Duration::from_secs(30),
            ),
            notify: RetryPolicy::fixed(3, Duration::from_secs(30)),
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// REST API version
    pub api_version: String,
    /// Environment definition (template reference) used for provisioning
    pub definition_file: Option<String>,
    /// Lifetime of provisioned environments, in days
    pub expiry_days: u32,
    /// Domain for generated signup usernames
    pub username_domain: String,
    /// Retry policies
    pub retry: RetrySettings,
    /// Age below which a record missing its live environment is left alone
    pub reconcile_grace_secs: u64,
}

impl PoolConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML text
    ///
    /// # Errors
    /// `PoolError::Config` on syntax or type errors, or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, PoolError> {
        let config: Self = toml::from_str(text).map_err(|e| PoolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// `PoolError::Config` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `PoolError::Config` naming the offending field.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.expiry_days == 0 || self.expiry_days > 30 {
            return Err(PoolError::Config(format!(
                "expiry_days must be within 1..=30, got {}",
                self.expiry_days
            )));
        }
        if self.api_version.is_empty() {
            return Err(PoolError::Config("api_version must not be empty".into()));
        }
        for (name, policy) in [
            ("provision", &self.retry.provision),
            ("records", &self.retry.records),
            ("visibility", &self.retry.visibility),
            ("notify", &self.retry.notify),
        ] {
            if policy.max_attempts == 0 {
                return Err(PoolError::Config(format!(
                    "retry.{name}.max_attempts must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// With API version
    #[inline]
    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// With definition file
    #[inline]
    #[must_use]
    pub fn with_definition_file(mut self, path: impl Into<String>) -> Self {
        self.definition_file = Some(path.into());
        self
    }

    /// With expiry
    #[inline]
    #[must_use]
    pub fn with_expiry_days(mut self, days: u32) -> Self {
        self.expiry_days = days;
        self
    }

    /// With retry settings
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Reconcile grace period
    #[inline]
    #[must_use]
    pub fn reconcile_grace(&self) -> Duration {
        Duration::from_secs(self.reconcile_grace_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            api_version: "58.0".to_string(),
            definition_file: None,
            expiry_days: 1,
            username_domain: "scratchpool.example.com".to_string(),
            retry: RetrySettings::default(),
            reconcile_grace_secs: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;

    #[test]
    fn empty_toml_is_default() {
        let config = PoolConfig::from_toml_str("").unwrap();
        assert_eq!(config, PoolConfig::default());
        assert_eq!(config.retry.provision.max_attempts, 3);
        assert_eq!(config.retry.provision.min_delay_ms, 30_000);
    }

    #[test]
    fn partial_override() {
        let config = PoolConfig::from_toml_str(
            r#"
            api_version = "60.0"
            expiry_days = 7
            definition_file = "config/project-scratch-def.json"

            [retry.records]
            max_attempts = 5
            min_delay_ms = 500
            backoff = { kind = "exponential", factor = 2.0, max_delay_ms = 4000 }
            "#,
        )
        .unwrap();

        assert_eq!(config.api_version, "60.0");
        assert_eq!(config.expiry_days, 7);
        assert_eq!(config.retry.records.max_attempts, 5);
        assert!(matches!(config.retry.records.backoff, Backoff::Exponential { .. }));
        assert_eq!(config.retry.provision, RetrySettings::default().provision);
    }

    #[test]
    fn rejects_out_of_range_expiry() {
        let err = PoolConfig::from_toml_str("expiry_days = 0").unwrap_err();
        assert!(err.to_string().contains("expiry_days"));
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = PoolConfig::from_toml_str("[retry.notify]\nmax_attempts = 0\nmin_delay_ms = 1")
            .unwrap_err();
        assert!(err.to_string().contains("retry.notify"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");
        std::fs::write(&path, "expiry_days = 3\n").unwrap();

        let config = PoolConfig::load(&path).unwrap();
        assert_eq!(config.expiry_days, 3);
        assert!(PoolConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
