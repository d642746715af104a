//! Repository hook
//!
//! Connects repository operations to the world outside the metadata store:
//!
//! ```text
//!   FileRepository::rotate
//!     ├── assign_volumes     registered volumes → volumes of the new file
//!     ├── FileResources      upload resource + credentials per new file
//!     ├── DiskSpaceEstimator pre-allocation of the new slices
//!     └── move_statistics    counters follow the level of the entity
//! ```
//!
//! [`SliceUploader`] and [`FileImporter`] are the seams of the later steps,
//! called by the node that owns the sink once a slice or file is closed.
//!
//! ## Retries
//!
//! An atomic operation may run its closure several times. Side effects
//! outside the store would then happen several times too, so `FileResources`
//! and `DiskSpaceEstimator` live for one logical operation and memoize their
//! results by key. When the operation finally fails, `FileResources::rollback`
//! deletes what was created, newest first.

use crate::config::RepositoryConfig;
use crate::definition::{Sink, Token};
use crate::error::{Result, StorageError};
use crate::statistics::{level_transform, StatisticsRepository};
use crate::volume::{assign_volumes, VolumeRegistry};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sinkhouse_core::{
    AllocConfig, AssignmentConfig, ByteSize, File, FileKey, Level, SinkKey, Slice, SliceKey,
    UploadCredentials, UtcTime, VolumeId,
};
use sinkhouse_metadata::Tx;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Upload target prepared in the staging storage for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResource {
    pub file_key: FileKey,
    pub id: String,
    pub credentials: UploadCredentials,
}

/// Staging storage API creating upload targets.
#[async_trait]
pub trait FileResourceProvider: Send + Sync {
    async fn create(
        &self,
        file_key: &FileKey,
        sink: &Sink,
        token: Option<&Token>,
    ) -> Result<FileResource>;

    async fn delete(&self, resource: &FileResource) -> Result<()>;
}

/// Moves the local data of a closed slice to the staging storage.
#[async_trait]
pub trait SliceUploader: Send + Sync {
    async fn upload(&self, slice: &Slice, file: &File) -> Result<()>;
}

/// Loads the uploaded slices of a file into its target table.
#[async_trait]
pub trait FileImporter: Send + Sync {
    async fn import(&self, file: &File, slices: &[Slice]) -> Result<()>;
}

/// A file resource request of one rotation.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub file_key: FileKey,
    pub sink: Sink,
    pub token: Option<Token>,
}

/// File resources created during one logical operation.
pub struct FileResources {
    provider: Arc<dyn FileResourceProvider>,
    parallelism: usize,
    // In creation order, rolled back in reverse.
    created: Mutex<Vec<FileResource>>,
}

impl FileResources {
    pub fn new(provider: Arc<dyn FileResourceProvider>, parallelism: usize) -> Self {
        Self {
            provider,
            parallelism: parallelism.max(1),
            created: Mutex::new(Vec::new()),
        }
    }

    fn memoized(&self, key: &FileKey) -> Option<FileResource> {
        let created = self.created.lock().unwrap_or_else(|e| e.into_inner());
        created.iter().find(|r| &r.file_key == key).cloned()
    }

    /// Resources for all requests, created in parallel if not created yet.
    ///
    /// Resources created before a failure stay memoized and are removed by
    /// [`rollback`](Self::rollback).
    pub async fn ensure(
        &self,
        requests: Vec<ResourceRequest>,
    ) -> Result<HashMap<FileKey, FileResource>> {
        let mut out = HashMap::with_capacity(requests.len());
        let mut missing = Vec::new();
        for request in requests {
            match self.memoized(&request.file_key) {
                Some(resource) => {
                    out.insert(request.file_key, resource);
                }
                None => missing.push(request),
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        let provider = &self.provider;
        let results: Vec<Result<FileResource>> = stream::iter(missing)
            .map(|request| async move {
                provider
                    .create(&request.file_key, &request.sink, request.token.as_ref())
                    .await
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let mut first_err = None;
        {
            let mut created = self.created.lock().unwrap_or_else(|e| e.into_inner());
            for result in results {
                match result {
                    Ok(resource) => {
                        debug!(file = %resource.file_key, resource = %resource.id, "file resource created");
                        created.push(resource.clone());
                        out.insert(resource.file_key.clone(), resource);
                    }
                    Err(e) if first_err.is_none() => first_err = Some(e),
                    Err(_) => {}
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Resource of one file, created if not created yet.
    pub async fn get_or_create(
        &self,
        file_key: &FileKey,
        sink: &Sink,
        token: Option<&Token>,
    ) -> Result<FileResource> {
        let mut resources = self
            .ensure(vec![ResourceRequest {
                file_key: file_key.clone(),
                sink: sink.clone(),
                token: token.cloned(),
            }])
            .await?;
        resources.remove(file_key).ok_or_else(|| {
            StorageError::Invalid(format!(
                "credentials for the sink \"{}\" was not provided",
                sink.key
            ))
        })
    }

    /// Deletes all created resources, newest first.
    ///
    /// Failures are logged, the error of the operation is what matters.
    pub async fn rollback(&self) {
        let created = {
            let mut created = self.created.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *created)
        };
        for resource in created.iter().rev() {
            match self.provider.delete(resource).await {
                Ok(()) => info!(file = %resource.file_key, resource = %resource.id, "file resource rolled back"),
                Err(e) => warn!(
                    file = %resource.file_key,
                    resource = %resource.id,
                    error = %e,
                    "cannot roll back file resource"
                ),
            }
        }
    }

    /// Runs the rollback if `result` is an error.
    pub async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.rollback().await;
        }
        result
    }
}

/// Sizes pre-allocations from the recent slices of a sink.
pub struct DiskSpaceEstimator {
    statistics: StatisticsRepository,
    history: usize,
    cache: Mutex<HashMap<SinkKey, Option<ByteSize>>>,
}

impl DiskSpaceEstimator {
    pub fn new(statistics: StatisticsRepository, history: usize) -> Self {
        Self {
            statistics,
            history,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Space to pre-allocate for the next slice of the sink.
    pub async fn for_sink(&self, sink: &SinkKey, config: &AllocConfig) -> Result<ByteSize> {
        if !config.enabled {
            return Ok(ByteSize::ZERO);
        }
        let cached = {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(sink).copied()
        };
        let max = match cached {
            Some(max) => max,
            None => {
                let max = self
                    .statistics
                    .max_used_disk_space(sink, self.history)
                    .await?;
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.insert(sink.clone(), max);
                max
            }
        };
        Ok(config.for_next_slice(max))
    }
}

pub struct Hook {
    volumes: VolumeRegistry,
    statistics: StatisticsRepository,
    provider: Arc<dyn FileResourceProvider>,
    config: RepositoryConfig,
}

impl Hook {
    pub fn new(
        volumes: VolumeRegistry,
        statistics: StatisticsRepository,
        provider: Arc<dyn FileResourceProvider>,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            volumes,
            statistics,
            provider,
            config,
        }
    }

    /// Starts a resource scope for one logical operation.
    pub fn file_resources(&self) -> FileResources {
        FileResources::new(self.provider.clone(), self.config.resource_parallelism)
    }

    /// Starts a disk space scope for one logical operation.
    pub fn disk_space(&self) -> DiskSpaceEstimator {
        DiskSpaceEstimator::new(self.statistics.clone(), self.config.disk_space_history)
    }

    /// Volumes for a file opened at `opened_at`.
    ///
    /// The opening time seeds the choice, so a retried rotation picks the
    /// same volumes.
    pub async fn assign_volumes(
        &self,
        config: &AssignmentConfig,
        opened_at: UtcTime,
    ) -> Result<Vec<VolumeId>> {
        let all = self.volumes.list_writable().await?;
        let assigned = assign_volumes(&all, config, opened_at.unix_nanos());
        if assigned.is_empty() {
            return Err(StorageError::NoVolumeAvailable);
        }
        Ok(assigned)
    }

    /// Moves slice counters on a level change, as part of `tx`.
    pub async fn move_slice_statistics(
        &self,
        tx: &Tx,
        slice: &SliceKey,
        from: Level,
        to: Level,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.statistics
            .move_in(tx, slice, from, to, level_transform(to))
            .await
    }

    /// Moves counters of all slices of a file on a level change, as part of `tx`.
    pub async fn move_file_statistics(
        &self,
        tx: &Tx,
        file: &FileKey,
        from: Level,
        to: Level,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.statistics
            .move_all_in(tx, file, from, to, level_transform(to))
            .await
    }

    pub async fn delete_slice_statistics(&self, tx: &Tx, slice: &SliceKey) -> Result<()> {
        self.statistics.delete_slice_in(tx, slice).await
    }

    pub async fn delete_file_statistics(&self, tx: &Tx, file: &FileKey) -> Result<()> {
        self.statistics.delete_file_in(tx, file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures::{put_local_stats, sink, RecordingProvider};
    use sinkhouse_core::time::must_parse;
    use sinkhouse_core::Value;
    use sinkhouse_metadata::MemoryKvStore;

    fn request(opened_at: &str) -> ResourceRequest {
        let sink = sink("my-sink");
        ResourceRequest {
            file_key: FileKey::new(sink.key.clone(), must_parse(opened_at)),
            sink,
            token: None,
        }
    }

    #[tokio::test]
    async fn test_resources_are_memoized() {
        let provider = Arc::new(RecordingProvider::default());
        let resources = FileResources::new(provider.clone(), 2);

        let requests = vec![
            request("2000-01-01T01:00:00.000Z"),
            request("2000-01-01T02:00:00.000Z"),
            request("2000-01-01T03:00:00.000Z"),
        ];
        let first = resources.ensure(requests.clone()).await.unwrap();
        let second = resources.ensure(requests).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.created_count(), 3);
    }

    #[tokio::test]
    async fn test_rollback_after_failure() {
        let provider = Arc::new(RecordingProvider::default());
        provider.fail_for("2000-01-01T02:00:00.000Z");
        let resources = FileResources::new(provider.clone(), 1);

        let result = resources
            .ensure(vec![
                request("2000-01-01T01:00:00.000Z"),
                request("2000-01-01T02:00:00.000Z"),
                request("2000-01-01T03:00:00.000Z"),
            ])
            .await;
        let err = resources.finish(result).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Upstream);

        // Created in order 01, 03; deleted newest first.
        assert_eq!(
            provider.deleted(),
            vec!["2000-01-01T03:00:00.000Z", "2000-01-01T01:00:00.000Z"]
        );
    }

    #[tokio::test]
    async fn test_disk_space_uses_history() {
        let store = Arc::new(MemoryKvStore::new());
        let statistics = StatisticsRepository::new(store.clone());
        let sink = sink("my-sink");
        let config = AllocConfig::default();

        let estimator = DiskSpaceEstimator::new(statistics.clone(), 10);
        assert_eq!(
            estimator.for_sink(&sink.key, &config).await.unwrap(),
            ByteSize::mb(100)
        );

        let file = FileKey::new(sink.key.clone(), must_parse("2000-01-01T01:00:00.000Z"));
        let slice = file
            .volume(VolumeId::new("my-volume").unwrap())
            .slice(must_parse("2000-01-01T01:00:00.000Z"));
        let mut value = Value::default();
        value.record(
            must_parse("2000-01-01T01:00:00.000Z"),
            10,
            ByteSize::mb(20),
            ByteSize::mb(10),
        );
        put_local_stats(store.as_ref(), &[(slice, value)]).await;

        // Memoized for the scope.
        assert_eq!(
            estimator.for_sink(&sink.key, &config).await.unwrap(),
            ByteSize::mb(100)
        );
        let estimator = DiskSpaceEstimator::new(statistics, 10);
        assert_eq!(
            estimator.for_sink(&sink.key, &config).await.unwrap(),
            ByteSize::mb(11)
        );

        let disabled = AllocConfig {
            enabled: false,
            ..config
        };
        assert_eq!(
            estimator.for_sink(&sink.key, &disabled).await.unwrap(),
            ByteSize::ZERO
        );
    }
}
