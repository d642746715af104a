//! Buffer quota
//!
//! Protects the pipeline from a receiver that accepts data faster than it can
//! be uploaded. Before a write is accepted, `check` compares the bytes the
//! source has buffered on local disks against a limit.
//!
//! ## Two-tier cache
//!
//! ```text
//!   check(source)
//!     ├── cache hit   → compare cached bytes with the limit
//!     └── cache miss  → sum local compressed sizes from statistics, cache it
//!
//!   record(source, n)  → adds n to an already cached entry
//!   every clear_interval → cache cleared, next check reloads statistics
//! ```
//!
//! ## Log rate limiting
//!
//! Every violation is returned to the caller, but only the first one per
//! source within `log_interval` has `log_enabled` set, so a receiver stuck
//! over the limit does not flood the logs.

use crate::error::{Result, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sinkhouse_core::config::duration_ms;
use sinkhouse_core::{ByteSize, SourceKey};
use sinkhouse_observability::metrics;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Maximum bytes buffered per source.
    #[serde(default = "default_limit")]
    pub limit: ByteSize,
    #[serde(default = "default_clear_interval", with = "duration_ms")]
    pub cache_clear_interval: Duration,
    #[serde(default = "default_log_interval", with = "duration_ms")]
    pub log_interval: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            cache_clear_interval: default_clear_interval(),
            log_interval: default_log_interval(),
        }
    }
}

fn default_limit() -> ByteSize {
    ByteSize::gb(1)
}

fn default_clear_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_log_interval() -> Duration {
    Duration::from_secs(60)
}

/// Authoritative source of buffered bytes, consulted on a cache miss.
#[async_trait]
pub trait BufferedBytesSource: Send + Sync {
    async fn buffered_bytes(&self, source: &SourceKey) -> Result<ByteSize>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "no free space in the buffer: receiver \"{source_key}\" has \"{buffered}\" buffered for upload, limit is \"{limit}\""
)]
pub struct QuotaError {
    pub source_key: SourceKey,
    pub buffered: ByteSize,
    pub limit: ByteSize,
    /// Set on the first violation within the log interval.
    pub log_enabled: bool,
}

pub struct QuotaChecker {
    config: QuotaConfig,
    source: Arc<dyn BufferedBytesSource>,
    cache: DashMap<SourceKey, ByteSize>,
    last_logged: DashMap<SourceKey, Instant>,
}

impl QuotaChecker {
    pub fn new(config: QuotaConfig, source: Arc<dyn BufferedBytesSource>) -> Arc<Self> {
        Arc::new(Self {
            config,
            source,
            cache: DashMap::new(),
            last_logged: DashMap::new(),
        })
    }

    /// Fails with `QuotaExceeded` if the source buffers more than the limit.
    pub async fn check(&self, key: &SourceKey) -> Result<()> {
        let buffered = match self.cache.get(key).map(|v| *v) {
            Some(bytes) => bytes,
            None => {
                let bytes = self.source.buffered_bytes(key).await?;
                self.cache.insert(key.clone(), bytes);
                bytes
            }
        };

        if buffered <= self.config.limit {
            return Ok(());
        }

        let err = QuotaError {
            source_key: key.clone(),
            buffered,
            limit: self.config.limit,
            log_enabled: self.should_log(key),
        };
        metrics::QUOTA_REJECTIONS_TOTAL.inc();
        if err.log_enabled {
            warn!(source = %key, buffered = %buffered, limit = %self.config.limit, "{}", err);
        }
        Err(StorageError::QuotaExceeded(err))
    }

    /// Accounts bytes written since the cache entry was loaded.
    ///
    /// Missing entries are left missing, the next check loads fresh totals.
    pub fn record(&self, key: &SourceKey, bytes: ByteSize) {
        if let Some(mut entry) = self.cache.get_mut(key) {
            *entry += bytes;
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn should_log(&self, key: &SourceKey) -> bool {
        let now = Instant::now();
        let mut enabled = false;
        self.last_logged
            .entry(key.clone())
            .and_modify(|last| {
                if now.duration_since(*last) >= self.config.log_interval {
                    *last = now;
                    enabled = true;
                }
            })
            .or_insert_with(|| {
                enabled = true;
                now
            });
        enabled
    }

    /// Starts the periodic cache clearing, until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move { checker.run(cancel).await })
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.cache_clear_interval.as_millis() as u64,
            "quota cache clearing started"
        );
        let mut ticker = tokio::time::interval(self.config.cache_clear_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.clear_cache();
                    debug!("quota cache cleared");
                }
            }
        }
        info!("quota cache clearing stopped");
    }
}
