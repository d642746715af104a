//! Writer Pool - Open Slice Writers of One Node
//!
//! Keeps one [`SliceWriter`] per opened slice on the local volumes and
//! connects the write path to the rest of the storage layer:
//!
//! ```text
//!   write(slice, row)
//!     ├── QuotaChecker::check     source over its buffer limit → rejected
//!     ├── SliceWriter::write_row  csv, codec, disk sync
//!     └── QuotaChecker::record    compressed bytes written since the last row
//!
//!   every sync interval
//!     └── StatisticsRepository::put   counters of all open writers
//! ```
//!
//! Counters of a slice that already left the local level are dropped by
//! the statistics repository, so a sync racing with an upload is harmless.
//!
//! ## Closing
//!
//! [`WriterPool::close`] removes the writer from the pool first, so no new
//! row can reach it, then finishes the file and stores the final counters.

use super::diskalloc::Allocator;
use super::writer::SliceWriter;
use crate::error::{Result, StorageError};
use crate::quota::QuotaChecker;
use crate::statistics::StatisticsRepository;
use sinkhouse_core::{ByteSize, Slice, SliceKey, UtcTime, Value, VolumeId};
use sinkhouse_observability::metrics;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WriterMap = Arc<RwLock<HashMap<SliceKey, Arc<SliceWriter>>>>;

pub struct WriterPool {
    writers: WriterMap,

    /// Local path of each volume of this node.
    volumes: HashMap<VolumeId, PathBuf>,

    allocator: Arc<dyn Allocator>,
    statistics: StatisticsRepository,
    quota: Arc<QuotaChecker>,
}

impl WriterPool {
    pub fn new(
        volumes: HashMap<VolumeId, PathBuf>,
        allocator: Arc<dyn Allocator>,
        statistics: StatisticsRepository,
        quota: Arc<QuotaChecker>,
    ) -> Self {
        Self {
            writers: Arc::new(RwLock::new(HashMap::new())),
            volumes,
            allocator,
            statistics,
            quota,
        }
    }

    /// Local path of the volume, if it belongs to this node.
    pub fn volume_path(&self, volume_id: &VolumeId) -> Option<&PathBuf> {
        self.volumes.get(volume_id)
    }

    /// Opens the writer of a new slice on its volume.
    pub async fn open(&self, slice: &Slice) -> Result<()> {
        let volume_id = slice.key.volume_id();
        let path = self
            .volumes
            .get(volume_id)
            .ok_or_else(|| StorageError::not_found("volume", volume_id))?;

        let mut writers = self.writers.write().await;
        if writers.contains_key(&slice.key) {
            return Err(StorageError::already_exists("slice writer", &slice.key));
        }
        let writer = SliceWriter::open(path, slice, self.allocator.as_ref())?;
        writers.insert(slice.key.clone(), Arc::new(writer));
        metrics::SLICE_WRITERS_OPEN.inc();
        Ok(())
    }

    pub async fn contains(&self, key: &SliceKey) -> bool {
        self.writers.read().await.contains_key(key)
    }

    /// Writes one row to an opened slice, subject to the buffer quota.
    pub async fn write(&self, now: UtcTime, key: &SliceKey, values: &[String]) -> Result<()> {
        let writer = self
            .writers
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found("slice writer", key))?;

        let source = &key.sink().source;
        self.quota.check(source).await?;

        let before = writer.stats().compressed_size;
        writer.write_row(now, values).await?;
        let after = writer.stats().compressed_size;
        self.quota
            .record(source, ByteSize(after.bytes().saturating_sub(before.bytes())));
        metrics::SLICE_ROWS_TOTAL.inc();
        Ok(())
    }

    /// Stores the counters of all open writers.
    ///
    /// Returns the number of accepted values.
    pub async fn sync_stats(&self) -> Result<usize> {
        let values: Vec<(SliceKey, Value)> = self
            .writers
            .read()
            .await
            .iter()
            .map(|(key, writer)| (key.clone(), writer.stats()))
            .filter(|(_, value)| value.records_count > 0)
            .collect();
        if values.is_empty() {
            return Ok(0);
        }

        let accepted = self.statistics.put(&values).await?;
        metrics::STATISTICS_SYNC_TOTAL
            .with_label_values(&["accepted"])
            .inc_by(accepted as u64);
        metrics::STATISTICS_SYNC_TOTAL
            .with_label_values(&["dropped"])
            .inc_by((values.len() - accepted) as u64);
        debug!(accepted, total = values.len(), "slice statistics synced");
        Ok(accepted)
    }

    /// Finishes the slice file and stores its final counters.
    ///
    /// Fails without closing anything while a write to the slice is in
    /// progress.
    pub async fn close(&self, key: &SliceKey) -> Result<Value> {
        let writer = {
            let mut writers = self.writers.write().await;
            let writer = writers
                .remove(key)
                .ok_or_else(|| StorageError::not_found("slice writer", key))?;
            match Arc::try_unwrap(writer) {
                Ok(writer) => writer,
                Err(writer) => {
                    writers.insert(key.clone(), writer);
                    return Err(StorageError::BadRequest(format!(
                        "slice writer \"{key}\" is in use"
                    )));
                }
            }
        };
        metrics::SLICE_WRITERS_OPEN.dec();

        let value = writer.close().await?;
        if value.records_count > 0 {
            self.statistics.put(&[(key.clone(), value.clone())]).await?;
        }
        info!(slice = %key, records = value.records_count, "slice writer closed");
        Ok(value)
    }

    pub async fn writer_count(&self) -> usize {
        self.writers.read().await.len()
    }

    /// Starts the periodic statistics sync.
    ///
    /// Counters are synced once more when `cancel` fires.
    pub fn start_background_sync(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.sync_stats().await {
                            error!(error = %e, "statistics sync failed");
                        }
                    }
                }
            }
            if let Err(e) = pool.sync_stats().await {
                warn!(error = %e, "final statistics sync failed");
            }
            debug!("statistics sync stopped");
        })
    }

    /// Closes all writers.
    pub async fn shutdown(&self) {
        let keys: Vec<SliceKey> = self.writers.read().await.keys().cloned().collect();
        info!(writers = keys.len(), "shutting down writer pool");
        for key in keys {
            if let Err(e) = self.close(&key).await {
                error!(slice = %key, error = %e, "cannot close slice writer");
            }
        }
    }
}
