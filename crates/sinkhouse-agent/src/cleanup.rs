//! Metadata Cleanup
//!
//! Deletes the metadata of expired files of owned sinks, together with
//! their slices and statistics.
//!
//! ## Expiration
//!
//! The age of a file is measured from its last state change.
//!
//! - An imported file expires after `archived_file_expiration`, but it is
//!   kept while at most `archived_file_retention_per_sink` newer files exist
//!   in its sink.
//! - Any other file expires after `active_file_expiration`, which leaves
//!   room for retries of a stuck upload or import.
//!
//! A run stops once more than `error_tolerance` deletions failed.

use crate::config::CleanupConfig;
use crate::distribution::DistributionNode;
use crate::error::Result;
use sinkhouse_core::{File, FileState, UtcTime};
use sinkhouse_metadata::{json_mapper, KvStore, Mirror};
use sinkhouse_observability::metrics;
use sinkhouse_storage::schema::definition as definition_keys;
use sinkhouse_storage::{Repository, Sink};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

impl CleanupConfig {
    /// `index` is the number of newer files in the sink.
    pub fn is_expired(&self, file: &File, now: UtcTime, index: usize) -> bool {
        let age = now.since(file.last_state_change());
        if file.state == FileState::Imported {
            return age >= self.archived_file_expiration
                && index > self.archived_file_retention_per_sink;
        }
        age >= self.active_file_expiration
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub retained: usize,
    pub failed: usize,
}

struct Inner {
    repo: Repository,
    dist: Arc<DistributionNode>,
    config: CleanupConfig,
    sinks: Mirror<Sink>,
    run_lock: Mutex<()>,
}

pub struct Cleanup {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Cleanup {
    /// Loads the sinks and starts the periodic cleanup, unless disabled.
    pub async fn start(
        store: Arc<dyn KvStore>,
        repo: Repository,
        dist: Arc<DistributionNode>,
        config: CleanupConfig,
    ) -> Result<Self> {
        config.validate()?;
        // Ownership is evaluated on each run.
        let sinks = Mirror::start(
            store,
            definition_keys::sinks_prefix(),
            json_mapper(|_: &Sink| true),
        )
        .await?;

        let inner = Arc::new(Inner {
            repo,
            dist,
            config,
            sinks,
            run_lock: Mutex::new(()),
        });
        let cancel = CancellationToken::new();
        let task = if config.enabled {
            info!(interval_secs = config.interval.as_secs(), "metadata cleanup started");
            Some(tokio::spawn(inner.clone().run_ticker(cancel.clone())))
        } else {
            info!("metadata cleanup is disabled");
            None
        };
        Ok(Self {
            inner,
            cancel,
            task: Mutex::new(task),
        })
    }

    /// Runs one cleanup at `now`.
    pub async fn clean(&self, now: UtcTime) -> Result<CleanupReport> {
        self.inner.clean(now).await
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "cleanup task failed");
            }
        }
        info!("metadata cleanup stopped");
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    async fn run_ticker(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.clean(UtcTime::now()).await {
                        error!(error = %e, "metadata cleanup failed");
                    }
                }
            }
        }
    }

    async fn clean(&self, now: UtcTime) -> Result<CleanupReport> {
        let _guard = self.run_lock.lock().await;
        let mut report = CleanupReport::default();
        let mut last_error = None;

        for sink in self.sinks.values() {
            if !self.dist.is_owner(&sink.key.to_string()) {
                continue;
            }
            let files = self.repo.files.list_recent_in(&sink.key, usize::MAX).await?;
            for (index, file) in files.iter().enumerate() {
                if !self.config.is_expired(file, now, index) {
                    report.retained += 1;
                    continue;
                }
                match self.repo.files.delete(&file.key).await {
                    Ok(()) => {
                        metrics::CLEANUP_DELETED_FILES_TOTAL.inc();
                        report.deleted += 1;
                        info!(file = %file.key, state = %file.state, "deleted expired file");
                    }
                    Err(e) => {
                        metrics::CLEANUP_FAILURES_TOTAL.inc();
                        report.failed += 1;
                        error!(file = %file.key, error = %e, "cannot delete expired file");
                        last_error = Some(e);
                        if report.failed > self.config.error_tolerance {
                            break;
                        }
                    }
                }
            }
            if report.failed > self.config.error_tolerance {
                break;
            }
        }

        info!(
            deleted = report.deleted,
            retained = report.retained,
            failed = report.failed,
            "metadata cleanup finished"
        );
        match last_error {
            Some(e) if report.failed > self.config.error_tolerance => Err(e.into()),
            _ => Ok(report),
        }
    }
}
