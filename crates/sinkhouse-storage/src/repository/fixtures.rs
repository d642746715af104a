//! Shared fixtures of the repository tests.

use super::hook::{FileResource, FileResourceProvider};
use super::Repository;
use crate::config::RepositoryConfig;
use crate::definition::{Branch, Sink, Source, Token};
use crate::error::{Result, StorageError};
use crate::schema::{stats as stats_keys, volume as volume_keys};
use crate::volume::VolumeInfo;
use async_trait::async_trait;
use sinkhouse_core::credentials::GcsCredentials;
use sinkhouse_core::{
    BranchKey, Column, FileKey, Level, SinkConfig, SinkKey, SliceKey, SourceKey,
    UploadCredentials, Value, VolumeId,
};
use sinkhouse_metadata::{encode, KvStore, MemoryKvStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub fn branch_key() -> BranchKey {
    BranchKey::new(123, 456)
}

pub fn source_key() -> SourceKey {
    SourceKey::new(branch_key(), "my-source").unwrap()
}

pub fn sink_key(id: &str) -> SinkKey {
    SinkKey::new(source_key(), id).unwrap()
}

pub fn sink(id: &str) -> Sink {
    Sink {
        key: sink_key(id),
        name: id.to_string(),
        table_id: "in.c-bucket.table".into(),
        columns: vec![Column::new("id"), Column::new("body")],
        config: SinkConfig::default(),
    }
}

/// Provider handing out GCS credentials valid for one hour.
#[derive(Default)]
pub struct RecordingProvider {
    created: Mutex<Vec<FileKey>>,
    deleted: Mutex<Vec<FileKey>>,
    fail_for: Mutex<HashSet<String>>,
}

impl RecordingProvider {
    /// Makes creation fail for files opened at `opened_at`.
    pub fn fail_for(&self, opened_at: &str) {
        self.fail_for.lock().unwrap().insert(opened_at.to_string());
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Opening times of deleted files, in deletion order.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted
            .lock()
            .unwrap()
            .iter()
            .map(|k| k.opened_at.to_string())
            .collect()
    }
}

#[async_trait]
impl FileResourceProvider for RecordingProvider {
    async fn create(
        &self,
        file_key: &FileKey,
        _sink: &Sink,
        _token: Option<&Token>,
    ) -> Result<FileResource> {
        if self
            .fail_for
            .lock()
            .unwrap()
            .contains(&file_key.opened_at.to_string())
        {
            return Err(StorageError::upstream(file_key, "staging API is unavailable"));
        }
        self.created.lock().unwrap().push(file_key.clone());
        Ok(FileResource {
            file_key: file_key.clone(),
            id: format!("resource-{}", file_key.opened_at.unix_millis()),
            credentials: UploadCredentials::Gcs(GcsCredentials {
                bucket: "bucket".into(),
                key_prefix: "prefix".into(),
                access_token: "token".into(),
                issued_at: file_key.opened_at,
                expires_in: 3600,
            }),
        })
    }

    async fn delete(&self, resource: &FileResource) -> Result<()> {
        self.deleted.lock().unwrap().push(resource.file_key.clone());
        Ok(())
    }
}

pub fn volume(id: &str, node: &str) -> VolumeInfo {
    VolumeInfo {
        volume_id: VolumeId::new(id).unwrap(),
        node_id: node.to_string(),
        node_address: format!("{node}:4000"),
        volume_type: "default".into(),
        label: id.to_string(),
        path: format!("/data/{id}"),
    }
}

pub async fn put_volumes(store: &dyn KvStore, volumes: &[VolumeInfo]) {
    for v in volumes {
        store
            .put(&volume_keys::writer(&v.volume_id), encode(v).unwrap())
            .await
            .unwrap();
    }
}

/// Writes local counters without a slice entity behind them.
pub async fn put_local_stats(store: &dyn KvStore, values: &[(SliceKey, Value)]) {
    for (key, value) in values {
        let mut value = value.clone();
        value.slices_count = 1;
        store
            .put(&stats_keys::value(Level::Local, key), encode(&value).unwrap())
            .await
            .unwrap();
    }
}

pub struct Fixture {
    pub store: Arc<MemoryKvStore>,
    pub repo: Repository,
    pub provider: Arc<RecordingProvider>,
}

/// Repository with one sink and one writable volume.
pub async fn setup() -> Fixture {
    let store = Arc::new(MemoryKvStore::new());
    let provider = Arc::new(RecordingProvider::default());
    let repo = Repository::new(store.clone(), provider.clone(), RepositoryConfig::default());

    repo.definitions
        .create_branch(Branch {
            key: branch_key(),
            is_default: true,
        })
        .await
        .unwrap();
    repo.definitions
        .create_source(Source {
            key: source_key(),
            name: "My Source".into(),
        })
        .await
        .unwrap();
    repo.definitions.create_sink(sink("my-sink")).await.unwrap();
    put_volumes(store.as_ref(), &[volume("my-volume", "node-1")]).await;

    Fixture {
        store,
        repo,
        provider,
    }
}
