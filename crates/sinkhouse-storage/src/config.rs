//! Storage Configuration
//!
//! Node-level settings of the storage layer. Per-sink settings (local
//! storage, compression, volume assignment, conditions) live in
//! [`SinkConfig`](sinkhouse_core::SinkConfig) and come with the sink
//! definition.
//!
//! ## RepositoryConfig
//!
//! - **resource_parallelism**: File resources created at once during a rotation (default: 20)
//! - **disk_space_history**: Recent slices inspected to size a pre-allocation (default: 10)
//! - **retry**: Backoff applied by `increment_retry` (default: 2m × 4, max 3h)
//! - **max_conflict_attempts**: Attempts of one atomic operation before giving up (default: 20)
//!
//! ## StorageConfig
//!
//! - **quota**: Buffered bytes limit per source, see [`QuotaConfig`]
//! - **volume_registration_ttl**: Lease TTL of registered volumes (default: 15s)
//! - **stats_sync_interval**: Statistics sync from open writers (default: 1s)
//!
//! ## Usage
//!
//! ```ignore
//! use sinkhouse_storage::StorageConfig;
//!
//! let config = StorageConfig {
//!     volume_registration_ttl: Duration::from_secs(30),
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use crate::error::{Result, StorageError};
use crate::quota::QuotaConfig;
use serde::{Deserialize, Serialize};
use sinkhouse_core::config::duration_ms;
use sinkhouse_core::RetryBackoff;
use sinkhouse_metadata::DEFAULT_MAX_ATTEMPTS;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_resource_parallelism")]
    pub resource_parallelism: usize,

    #[serde(default = "default_disk_space_history")]
    pub disk_space_history: usize,

    #[serde(default)]
    pub retry: RetryBackoff,

    #[serde(default = "default_max_conflict_attempts")]
    pub max_conflict_attempts: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            resource_parallelism: default_resource_parallelism(),
            disk_space_history: default_disk_space_history(),
            retry: RetryBackoff::default(),
            max_conflict_attempts: default_max_conflict_attempts(),
        }
    }
}

fn default_resource_parallelism() -> usize {
    20
}

fn default_disk_space_history() -> usize {
    10
}

fn default_max_conflict_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    /// Lease TTL of registered volumes (default: 15s)
    #[serde(default = "default_volume_ttl", with = "duration_ms")]
    pub volume_registration_ttl: Duration,

    /// Period of the statistics sync from open slice writers (default: 1s)
    #[serde(default = "default_stats_sync_interval", with = "duration_ms")]
    pub stats_sync_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig::default(),
            quota: QuotaConfig::default(),
            volume_registration_ttl: default_volume_ttl(),
            stats_sync_interval: default_stats_sync_interval(),
        }
    }
}

fn default_volume_ttl() -> Duration {
    Duration::from_secs(15)
}

fn default_stats_sync_interval() -> Duration {
    Duration::from_secs(1)
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.repository.resource_parallelism == 0 {
            return Err(StorageError::BadRequest(
                "invalid config: resource parallelism must be greater than zero".into(),
            ));
        }
        if self.repository.max_conflict_attempts == 0 {
            return Err(StorageError::BadRequest(
                "invalid config: max conflict attempts must be greater than zero".into(),
            ));
        }
        if self.volume_registration_ttl < Duration::from_secs(1) {
            return Err(StorageError::BadRequest(
                "invalid config: volume registration TTL must be at least 1s".into(),
            ));
        }
        if self.stats_sync_interval.is_zero() {
            return Err(StorageError::BadRequest(
                "invalid config: statistics sync interval is not set".into(),
            ));
        }
        Ok(())
    }
}
