//! Statistics repository
//!
//! Per-slice counters stored under the level the slice data currently lives
//! in. When a slice or file crosses a level boundary its counters move with
//! it, inside the same transaction as the state change:
//!
//! ```text
//!   slice Uploading → Uploaded
//!     storage/stats/local/<slice>/value   ──move──►  storage/stats/staging/<slice>/value
//!                                           (staging_size = compressed_size)
//! ```
//!
//! A counter is never present in two levels and never missing from both.
//!
//! ## Deletion
//!
//! Local and staging counters of a deleted object are dropped, the data never
//! reached the target. Target counters are rolled up into the sink's `_sum`
//! key, so sink totals survive metadata cleanup.

use crate::error::{Result, StorageError};
use crate::schema::{stats as keys, SLICES};
use crate::quota::BufferedBytesSource;
use async_trait::async_trait;
use sinkhouse_core::{
    Aggregated, ByteSize, FileKey, KeyPrefix, Level, SinkKey, SliceKey, SourceKey, Value,
};
use sinkhouse_metadata::{AtomicOp, KvStore, Tx};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Rewrites a value while it moves between levels.
pub type Transform = fn(&mut Value);

/// Transform applied when data enters `to`.
pub fn level_transform(to: Level) -> Transform {
    match to {
        // No further compression happens on upload.
        Level::Staging => |v: &mut Value| v.staging_size = v.compressed_size,
        Level::Local | Level::Target => |_: &mut Value| {},
    }
}

#[derive(Clone)]
pub struct StatisticsRepository {
    store: Arc<dyn KvStore>,
    op: AtomicOp,
}

impl StatisticsRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            op: AtomicOp::new(store.clone()),
            store,
        }
    }

    /// Writes local counters reported by slice writers.
    ///
    /// A value is accepted only while its slice is in the local level. A
    /// flush arriving after the slice was uploaded or deleted is dropped, so
    /// the counters never live in two levels. Returns the number of accepted
    /// values.
    pub async fn put(&self, values: &[(SliceKey, Value)]) -> Result<usize> {
        let accepted = self
            .op
            .run("statistics.put", |tx| async move {
                let mut accepted = 0;
                for (key, value) in values {
                    if !tx.exists(&SLICES.in_level(Level::Local, key)).await? {
                        continue;
                    }
                    let mut value = value.clone();
                    value.slices_count = 1;
                    tx.put_json(keys::value(Level::Local, key), &value)?;
                    accepted += 1;
                }
                Ok::<_, StorageError>(accepted)
            })
            .await?;
        if accepted < values.len() {
            debug!(
                dropped = values.len() - accepted,
                "statistics of slices outside the local level dropped"
            );
        }
        Ok(accepted)
    }

    /// Moves the counters of one slice, as part of `tx`.
    ///
    /// Missing counters are not an error, the slice may have no records.
    ///
    /// # Panics
    ///
    /// If `from == to`; callers only move on a level change.
    pub async fn move_in(
        &self,
        tx: &Tx,
        slice: &SliceKey,
        from: Level,
        to: Level,
        transform: Transform,
    ) -> Result<()> {
        assert_ne!(
            from, to,
            "\"from\" and \"to\" storage levels are same and equal to \"{from}\""
        );
        let from_key = keys::value(from, slice);
        let Some(mut value) = tx.get_json::<Value>(&from_key).await? else {
            return Ok(());
        };
        transform(&mut value);
        tx.put_json(keys::value(to, slice), &value)?;
        tx.delete(from_key);
        Ok(())
    }

    /// Moves the counters of all slices of a file, as part of `tx`.
    ///
    /// # Panics
    ///
    /// If `from == to`.
    pub async fn move_all_in(
        &self,
        tx: &Tx,
        file: &FileKey,
        from: Level,
        to: Level,
        transform: Transform,
    ) -> Result<()> {
        assert_ne!(
            from, to,
            "\"from\" and \"to\" storage levels are same and equal to \"{from}\""
        );
        for kv in tx.get_prefix(&keys::in_level(from, file)).await? {
            let Some(slice) = keys::parse_slice_key(&kv.key) else {
                continue;
            };
            let mut value: Value = kv.decode()?;
            transform(&mut value);
            tx.put_json(keys::value(to, &slice), &value)?;
            tx.delete(kv.key);
        }
        Ok(())
    }

    /// Standalone variant of [`move_in`](Self::move_in).
    pub async fn move_slice(&self, slice: &SliceKey, from: Level, to: Level) -> Result<()> {
        self.op
            .run("statistics.move", |tx| async move {
                self.move_in(&tx, slice, from, to, level_transform(to)).await
            })
            .await
    }

    /// Deletes counters of a slice, as part of `tx`.
    pub async fn delete_slice_in(&self, tx: &Tx, slice: &SliceKey) -> Result<()> {
        if let Some(value) = tx.get_json::<Value>(&keys::value(Level::Target, slice)).await? {
            self.roll_up(tx, slice.sink(), value).await?;
        }
        for level in Level::ALL {
            tx.delete(keys::value(level, slice));
        }
        Ok(())
    }

    /// Deletes counters of all slices of a file, as part of `tx`.
    pub async fn delete_file_in(&self, tx: &Tx, file: &FileKey) -> Result<()> {
        let mut target = Value::default();
        for kv in tx.get_prefix(&keys::in_level(Level::Target, file)).await? {
            target += kv.decode::<Value>()?;
        }
        if !target.is_empty() {
            self.roll_up(tx, file.sink(), target).await?;
        }
        for level in Level::ALL {
            tx.delete_prefix(keys::in_level(level, file));
        }
        Ok(())
    }

    async fn roll_up(&self, tx: &Tx, sink: &SinkKey, value: Value) -> Result<()> {
        let key = keys::sum(sink);
        let mut sum = tx.get_json::<Value>(&key).await?.unwrap_or_default();
        sum += value;
        debug!(sink = %sink, records = sum.records_count, "statistics rolled up");
        tx.put_json(key, &sum)?;
        Ok(())
    }

    /// Statistics of everything under `parent`, split by level.
    pub async fn aggregate_in(&self, parent: &impl KeyPrefix) -> Result<Aggregated> {
        let mut out = Aggregated::default();
        for level in Level::ALL {
            let resp = self.store.get_prefix(&keys::in_level(level, parent)).await?;
            for kv in &resp.kvs {
                out.add(level, &kv.decode::<Value>()?);
            }
        }
        Ok(out)
    }

    pub async fn file_stats(&self, file: &FileKey) -> Result<Aggregated> {
        self.aggregate_in(file).await
    }

    pub async fn slice_stats(&self, slice: &SliceKey) -> Result<Aggregated> {
        let mut out = Aggregated::default();
        for level in Level::ALL {
            if let Some(kv) = self.store.get(&keys::value(level, slice)).await? {
                out.add(level, &kv.decode::<Value>()?);
            }
        }
        Ok(out)
    }

    /// Compressed sizes of the last `n` slices of the sink, oldest first.
    pub async fn last_slice_sizes(&self, sink: &SinkKey, n: usize) -> Result<Vec<ByteSize>> {
        let mut per_slice: BTreeMap<SliceKey, ByteSize> = BTreeMap::new();
        for level in Level::ALL {
            let resp = self.store.get_prefix(&keys::in_level(level, sink)).await?;
            for kv in &resp.kvs {
                if let Some(slice) = keys::parse_slice_key(&kv.key) {
                    let value: Value = kv.decode()?;
                    *per_slice.entry(slice).or_default() += value.compressed_size;
                }
            }
        }
        let mut sizes: Vec<(SliceKey, ByteSize)> = per_slice.into_iter().collect();
        sizes.sort_by(|(a, _), (b, _)| a.opened_at.cmp(&b.opened_at).then_with(|| a.cmp(b)));
        let skip = sizes.len().saturating_sub(n);
        Ok(sizes.into_iter().skip(skip).map(|(_, size)| size).collect())
    }

    /// Largest compressed size among the last `n` slices of the sink.
    pub async fn max_used_disk_space(&self, sink: &SinkKey, n: usize) -> Result<Option<ByteSize>> {
        Ok(self.last_slice_sizes(sink, n).await?.into_iter().max())
    }
}

#[async_trait]
impl BufferedBytesSource for StatisticsRepository {
    async fn buffered_bytes(&self, source: &SourceKey) -> Result<ByteSize> {
        let resp = self
            .store
            .get_prefix(&keys::in_level(Level::Local, source))
            .await?;
        let mut total = ByteSize::ZERO;
        for kv in &resp.kvs {
            total += kv.decode::<Value>()?.compressed_size;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sinkhouse_core::time::must_parse;
    use sinkhouse_core::{BranchKey, SliceState, VolumeId};
    use crate::repository::fixtures::{put_local_stats, setup as repository_setup};
    use sinkhouse_metadata::MemoryKvStore;
    use proptest::prelude::*;

    fn file_key(opened_at: &str) -> FileKey {
        let source = SourceKey::new(BranchKey::new(123, 456), "my-source").unwrap();
        let sink = SinkKey::new(source, "my-sink").unwrap();
        FileKey::new(sink, must_parse(opened_at))
    }

    fn slice_key(file: &FileKey, opened_at: &str) -> SliceKey {
        file.volume(VolumeId::new("my-volume").unwrap())
            .slice(must_parse(opened_at))
    }

    fn value(records: u64, compressed: u64) -> Value {
        let mut v = Value::default();
        v.record(
            must_parse("2000-01-01T01:00:00.000Z"),
            records,
            ByteSize(compressed * 2),
            ByteSize(compressed),
        );
        v
    }

    fn setup() -> (Arc<MemoryKvStore>, StatisticsRepository) {
        let store = Arc::new(MemoryKvStore::new());
        let repo = StatisticsRepository::new(store.clone());
        (store, repo)
    }

    #[tokio::test]
    async fn test_move_sets_staging_size() {
        let (store, repo) = setup();
        let file = file_key("2000-01-01T01:00:00.000Z");
        let slice = slice_key(&file, "2000-01-01T01:00:00.000Z");
        put_local_stats(store.as_ref(), &[(slice.clone(), value(10, 100))]).await;

        repo.move_slice(&slice, Level::Local, Level::Staging)
            .await
            .unwrap();

        let stats = repo.slice_stats(&slice).await.unwrap();
        assert!(stats.local.is_empty());
        assert_eq!(stats.staging.records_count, 10);
        assert_eq!(stats.staging.staging_size, ByteSize(100));
        assert_eq!(stats.total.slices_count, 1);
    }

    #[tokio::test]
    async fn test_move_missing_is_noop() {
        let (store, repo) = setup();
        let file = file_key("2000-01-01T01:00:00.000Z");
        let slice = slice_key(&file, "2000-01-01T01:00:00.000Z");
        repo.move_slice(&slice, Level::Local, Level::Staging)
            .await
            .unwrap();
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "\"from\" and \"to\" storage levels are same and equal to \"staging\"")]
    async fn test_move_same_level_panics() {
        let (_, repo) = setup();
        let file = file_key("2000-01-01T01:00:00.000Z");
        let slice = slice_key(&file, "2000-01-01T01:00:00.000Z");
        let _ = repo.move_slice(&slice, Level::Staging, Level::Staging).await;
    }

    #[tokio::test]
    async fn test_delete_rolls_up_target_only() {
        let (store, repo) = setup();
        let file = file_key("2000-01-01T01:00:00.000Z");
        let s1 = slice_key(&file, "2000-01-01T01:00:00.000Z");
        let s2 = slice_key(&file, "2000-01-01T02:00:00.000Z");
        let s3 = slice_key(&file, "2000-01-01T03:00:00.000Z");
        put_local_stats(
            store.as_ref(),
            &[
                (s1.clone(), value(1, 10)),
                (s2.clone(), value(2, 20)),
                (s3.clone(), value(4, 40)),
            ],
        )
        .await;
        repo.move_slice(&s2, Level::Local, Level::Staging).await.unwrap();
        repo.move_slice(&s3, Level::Local, Level::Staging).await.unwrap();
        repo.move_slice(&s3, Level::Staging, Level::Target).await.unwrap();

        let op = AtomicOp::new(store.clone());
        op.run("delete", |tx| {
            let repo = repo.clone();
            let file = file.clone();
            async move { repo.delete_file_in(&tx, &file).await }
        })
        .await
        .unwrap();

        let keys = store.keys().await;
        assert_eq!(
            keys,
            vec!["storage/stats/target/123/456/my-source/my-sink/_sum".to_string()]
        );
        let sink_stats = repo.aggregate_in(file.sink()).await.unwrap();
        assert_eq!(sink_stats.target.records_count, 4);
        assert_eq!(sink_stats.total.records_count, 4);
    }

    #[tokio::test]
    async fn test_last_slice_sizes() {
        let (store, repo) = setup();
        let file = file_key("2000-01-01T01:00:00.000Z");
        let mut values = Vec::new();
        for i in 0..12u64 {
            let slice = slice_key(&file, &format!("2000-01-01T01:{:02}:00.000Z", i));
            values.push((slice, value(1, 100 + i)));
        }
        put_local_stats(store.as_ref(), &values).await;

        let sizes = repo.last_slice_sizes(file.sink(), 10).await.unwrap();
        assert_eq!(sizes.len(), 10);
        assert_eq!(sizes[0], ByteSize(102));
        assert_eq!(
            repo.max_used_disk_space(file.sink(), 10).await.unwrap(),
            Some(ByteSize(111))
        );
    }

    #[tokio::test]
    async fn test_buffered_bytes_counts_local_only() {
        let (store, repo) = setup();
        let file = file_key("2000-01-01T01:00:00.000Z");
        let s1 = slice_key(&file, "2000-01-01T01:00:00.000Z");
        let s2 = slice_key(&file, "2000-01-01T02:00:00.000Z");
        put_local_stats(store.as_ref(), &[(s1.clone(), value(1, 10)), (s2.clone(), value(1, 20))])
            .await;
        repo.move_slice(&s2, Level::Local, Level::Staging).await.unwrap();
        assert_eq!(
            repo.buffered_bytes(&file.sink().source).await.unwrap(),
            ByteSize(10)
        );
    }

    #[tokio::test]
    async fn test_put_accepts_local_slices_only() {
        let f = repository_setup().await;
        let t1 = must_parse("2000-01-01T01:00:00.000Z");
        let file = f
            .repo
            .files
            .rotate(t1, &crate::repository::fixtures::sink_key("my-sink"))
            .await
            .unwrap();
        let volume = file.key.volume(VolumeId::new("my-volume").unwrap());
        let slice = volume.slice(t1);
        let unknown = file.key.volume(VolumeId::new("other").unwrap()).slice(t1);

        let accepted = f
            .repo
            .statistics
            .put(&[(slice.clone(), value(100, 10)), (unknown, value(1, 1))])
            .await
            .unwrap();
        assert_eq!(accepted, 1);

        f.repo.slices.close(t1, &volume).await.unwrap().unwrap();
        for (from, to) in [
            (SliceState::Closing, SliceState::Uploading),
            (SliceState::Uploading, SliceState::Uploaded),
        ] {
            f.repo
                .slices
                .state_transition(t1, &slice, from, to)
                .await
                .unwrap();
        }

        // A late flush from the writer.
        let accepted = f
            .repo
            .statistics
            .put(&[(slice.clone(), value(100, 10))])
            .await
            .unwrap();
        assert_eq!(accepted, 0);

        let stats = f.repo.statistics.slice_stats(&slice).await.unwrap();
        assert!(stats.local.is_empty());
        assert_eq!(stats.staging.records_count, 100);
        assert_eq!(stats.total.records_count, 100);
    }

    proptest! {
        #[test]
        fn prop_move_all_conserves_counts(sizes in proptest::collection::vec((1u64..1000, 1u64..10_000), 1..8)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (store, repo) = setup();
                let file = file_key("2000-01-01T01:00:00.000Z");
                let values: Vec<(SliceKey, Value)> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, (records, compressed))| {
                        let slice = slice_key(&file, &format!("2000-01-01T02:{:02}:00.000Z", i));
                        (slice, value(*records, *compressed))
                    })
                    .collect();
                put_local_stats(store.as_ref(), &values).await;
                let before = repo.file_stats(&file).await.unwrap();

                let op = AtomicOp::new(store.clone());
                op.run("move_all", |tx| {
                    let repo = repo.clone();
                    let file = file.clone();
                    async move {
                        repo.move_all_in(&tx, &file, Level::Local, Level::Staging, level_transform(Level::Staging)).await
                    }
                })
                .await
                .unwrap();

                let after = repo.file_stats(&file).await.unwrap();
                assert!(after.local.is_empty());
                assert_eq!(after.staging.records_count, before.local.records_count);
                assert_eq!(after.staging.compressed_size, before.local.compressed_size);
                assert_eq!(after.staging.uncompressed_size, before.local.uncompressed_size);
                assert_eq!(after.staging.slices_count, before.local.slices_count);
                assert_eq!(after.staging.staging_size, before.local.compressed_size);
            });
        }
    }
}
