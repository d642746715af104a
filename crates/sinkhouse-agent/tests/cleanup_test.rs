//! Metadata Cleanup Tests
//!
//! Tests that verify expired files are deleted with their slices:
//! - Imported files expire sooner, the newest ones are retained
//! - Other files expire after the active expiration
//! - Sinks owned by other nodes are left alone

use sinkhouse_agent::{
    Cleanup, CleanupConfig, DistributionConfig, DistributionNode, StaticResourceConfig,
    StaticResourceProvider,
};
use sinkhouse_core::time::must_parse;
use sinkhouse_core::{
    BranchKey, Column, FileKey, FileState, SinkKey, SliceState, SourceKey, UtcTime, VolumeId,
};
use sinkhouse_metadata::{encode, KvStore, MemoryKvStore};
use sinkhouse_storage::definition::{Branch, Sink, Source};
use sinkhouse_storage::schema::volume as volume_keys;
use sinkhouse_storage::{ErrorKind, Repository, RepositoryConfig, VolumeInfo};
use std::sync::Arc;
use std::time::Duration;

const T0: &str = "2000-01-01T00:00:00.000Z";

fn at(offset: Duration) -> UtcTime {
    must_parse(T0).plus(offset)
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 3600)
}

fn source_key() -> SourceKey {
    SourceKey::new(BranchKey::new(123, 456), "my-source").unwrap()
}

struct Setup {
    store: Arc<dyn KvStore>,
    repo: Repository,
}

async fn setup() -> Setup {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let provider = Arc::new(StaticResourceProvider::new(StaticResourceConfig {
        expires_in: 30 * 24 * 3600,
        ..Default::default()
    }));
    let repo = Repository::new(store.clone(), provider, RepositoryConfig::default());
    repo.definitions
        .create_branch(Branch {
            key: source_key().branch,
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
    let volume = VolumeInfo {
        volume_id: VolumeId::new("my-volume").unwrap(),
        node_id: "node-1".into(),
        node_address: String::new(),
        volume_type: "default".into(),
        label: "my-volume".into(),
        path: "/data/my-volume".into(),
    };
    store
        .put(&volume_keys::writer(&volume.volume_id), encode(&volume).unwrap())
        .await
        .unwrap();
    Setup { store, repo }
}

async fn create_sink(s: &Setup, name: &str) -> SinkKey {
    let key = SinkKey::new(source_key(), name).unwrap();
    s.repo
        .definitions
        .create_sink(Sink {
            key: key.clone(),
            name: name.into(),
            table_id: "in.c-bucket.table".into(),
            columns: vec![Column::new("id")],
            config: Default::default(),
        })
        .await
        .unwrap();
    key
}

/// Uploads the slices of a closed file and imports it.
async fn import(s: &Setup, file: &FileKey, now: UtcTime) {
    for slice in s.repo.slices.list_in(file).await.unwrap() {
        s.repo
            .slices
            .state_transition(now, &slice.key, SliceState::Closing, SliceState::Uploading)
            .await
            .unwrap();
        s.repo
            .slices
            .state_transition(now, &slice.key, SliceState::Uploading, SliceState::Uploaded)
            .await
            .unwrap();
    }
    s.repo
        .files
        .state_transition(now, file, FileState::Closing, FileState::Importing)
        .await
        .unwrap();
    s.repo
        .files
        .state_transition(now, file, FileState::Importing, FileState::Imported)
        .await
        .unwrap();
}

fn dist_config() -> DistributionConfig {
    DistributionConfig {
        group: "test".into(),
        ..Default::default()
    }
}

fn cleanup_config() -> CleanupConfig {
    CleanupConfig {
        enabled: false,
        archived_file_retention_per_sink: 2,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_expired_files_are_deleted() {
    let s = setup().await;
    let sink = create_sink(&s, "my-sink").await;
    let mut files = Vec::new();
    for hour in 0..4 {
        files.push(s.repo.files.rotate(at(hours(hour)), &sink).await.unwrap().key);
    }
    import(&s, &files[0], at(hours(3))).await;
    import(&s, &files[1], at(hours(3))).await;

    let node = Arc::new(DistributionNode::start(s.store.clone(), "node-1", dist_config()).await.unwrap());
    let cleanup = Cleanup::start(s.store.clone(), s.repo.clone(), node.clone(), cleanup_config())
        .await
        .unwrap();

    // Imported files are too young.
    let report = cleanup.clean(at(hours(8))).await.unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(report.retained, 4);

    // The oldest file has three newer files, one more than retained.
    let report = cleanup.clean(at(hours(9))).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.retained, 3);
    let err = s.repo.files.get(&files[0]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(s.repo.slices.list_in(&files[0]).await.unwrap().is_empty());
    assert_eq!(s.repo.files.get(&files[1]).await.unwrap().state, FileState::Imported);

    // Closing and writing files expire after a week.
    let report = cleanup.clean(at(hours(3 + 7 * 24))).await.unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.retained, 1);
    let left = s.repo.files.list_in(&sink).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].key, files[1]);

    cleanup.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_not_owned_sinks_are_skipped() {
    let s = setup().await;
    let mut sinks = Vec::new();
    for i in 0..8 {
        let sink = create_sink(&s, &format!("sink-{i}")).await;
        s.repo.files.rotate(at(hours(0)), &sink).await.unwrap();
        sinks.push(sink);
    }

    let node1 = Arc::new(DistributionNode::start(s.store.clone(), "node-1", dist_config()).await.unwrap());
    let mut changes = node1.subscribe();
    let node2 = DistributionNode::start(s.store.clone(), "node-2", dist_config()).await.unwrap();
    changes.changed().await.unwrap();
    let owned = sinks
        .iter()
        .filter(|k| node1.is_owner(&k.to_string()))
        .count();

    let cleanup = Cleanup::start(s.store.clone(), s.repo.clone(), node1.clone(), cleanup_config())
        .await
        .unwrap();
    let report = cleanup.clean(at(hours(8 * 24))).await.unwrap();
    assert_eq!(report.deleted, owned);
    assert_eq!(report.retained, 0);

    cleanup.stop().await;
    node2.stop().await;
    node1.stop().await;
}
