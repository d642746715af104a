//! Worker Configuration
//!
//! ## DistributionConfig
//!
//! - **group**: Nodes of one group share the work (default: "storage-worker")
//! - **ttl**: Lease TTL of the node registration (default: 15s)
//! - **keep_alive**: Interval of lease renewals (default: 5s)
//! - **startup_timeout**: Max wait for the node to see itself in the group (default: 10s)
//!
//! ## CheckerConfig
//!
//! - **interval**: Period of the condition checks (default: 30s)
//! - **min_credentials_expiration**: Files whose upload credentials expire
//!   sooner are rotated regardless of conditions (default: 1h)
//!
//! ## CleanupConfig
//!
//! - **enabled**: Periodic metadata cleanup (default: true)
//! - **interval**: Period of the cleanup (default: 30s)
//! - **active_file_expiration**: Age of a not imported file (default: 7 days)
//! - **archived_file_expiration**: Age of an imported file (default: 6h)
//! - **archived_file_retention_per_sink**: Imported files with at most this
//!   many newer files in the sink are kept (default: 50)
//! - **error_tolerance**: Failed deletions tolerated in one run (default: 10)

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use sinkhouse_core::config::duration_ms;
use sinkhouse_storage::StorageConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default = "default_group")]
    pub group: String,

    #[serde(default = "default_ttl", with = "duration_ms")]
    pub ttl: Duration,

    #[serde(default = "default_keep_alive", with = "duration_ms")]
    pub keep_alive: Duration,

    #[serde(default = "default_startup_timeout", with = "duration_ms")]
    pub startup_timeout: Duration,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            ttl: default_ttl(),
            keep_alive: default_keep_alive(),
            startup_timeout: default_startup_timeout(),
        }
    }
}

fn default_group() -> String {
    "storage-worker".to_string()
}

fn default_ttl() -> Duration {
    Duration::from_secs(15)
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(5)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(10)
}

impl DistributionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group.is_empty() {
            return Err(AgentError::InvalidConfig("distribution group is not set".into()));
        }
        if self.keep_alive >= self.ttl {
            return Err(AgentError::InvalidConfig(format!(
                "keep-alive interval {:?} must be shorter than TTL {:?}",
                self.keep_alive, self.ttl
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerConfig {
    #[serde(default = "default_check_interval", with = "duration_ms")]
    pub interval: Duration,

    #[serde(default = "default_min_credentials_expiration", with = "duration_ms")]
    pub min_credentials_expiration: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval: default_check_interval(),
            min_credentials_expiration: default_min_credentials_expiration(),
        }
    }
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_min_credentials_expiration() -> Duration {
    Duration::from_secs(60 * 60)
}

impl CheckerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(AgentError::InvalidConfig("check interval is not set".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_cleanup_interval", with = "duration_ms")]
    pub interval: Duration,

    /// Expiration of files not imported yet
    #[serde(default = "default_active_file_expiration", with = "duration_ms")]
    pub active_file_expiration: Duration,

    /// Expiration of imported files
    #[serde(default = "default_archived_file_expiration", with = "duration_ms")]
    pub archived_file_expiration: Duration,

    #[serde(default = "default_archived_file_retention_per_sink")]
    pub archived_file_retention_per_sink: usize,

    /// Failed deletions tolerated in one run
    #[serde(default = "default_error_tolerance")]
    pub error_tolerance: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval: default_cleanup_interval(),
            active_file_expiration: default_active_file_expiration(),
            archived_file_expiration: default_archived_file_expiration(),
            archived_file_retention_per_sink: default_archived_file_retention_per_sink(),
            error_tolerance: default_error_tolerance(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_active_file_expiration() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_archived_file_expiration() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_archived_file_retention_per_sink() -> usize {
    50
}

fn default_error_tolerance() -> usize {
    10
}

impl CleanupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.interval.is_zero() {
            return Err(AgentError::InvalidConfig("cleanup interval is not set".into()));
        }
        Ok(())
    }
}

/// Everything a worker node needs besides its id and the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub distribution: DistributionConfig,

    #[serde(default)]
    pub checker: CheckerConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        self.distribution.validate()?;
        self.checker.validate()?;
        self.cleanup.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.checker.interval, Duration::from_secs(30));
        assert_eq!(
            config.checker.min_credentials_expiration,
            Duration::from_secs(3600)
        );
        assert_eq!(config.distribution.ttl, Duration::from_secs(15));
    }

    #[test]
    fn test_partial_json() {
        let config: WorkerConfig =
            serde_json::from_str(r#"{"checker": {"interval": 1000}, "distribution": {"group": "g1"}}"#)
                .unwrap();
        assert_eq!(config.checker.interval, Duration::from_secs(1));
        assert_eq!(config.distribution.group, "g1");
        assert_eq!(config.distribution.keep_alive, Duration::from_secs(5));
    }

    #[test]
    fn test_cleanup_defaults() {
        let config = CleanupConfig::default();
        config.validate().unwrap();
        assert!(config.enabled);
        assert_eq!(config.active_file_expiration, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.archived_file_expiration, Duration::from_secs(6 * 3600));

        let config: CleanupConfig =
            serde_json::from_str(r#"{"enabled": false, "archived_file_retention_per_sink": 1}"#)
                .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.archived_file_retention_per_sink, 1);
        assert_eq!(config.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_keep_alive_shorter_than_ttl() {
        let mut config = DistributionConfig::default();
        config.keep_alive = config.ttl;
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "invalid config: keep-alive interval 15s must be shorter than TTL 15s"
        );
    }
}
