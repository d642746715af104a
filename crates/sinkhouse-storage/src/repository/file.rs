//! File repository
//!
//! ## Lifecycle
//!
//! ```text
//!   rotate(sink)       closes the opened file of the sink, opens a new one
//!                      with one slice per assigned volume
//!   close(file)        Writing → Closing, writing slices → Closing
//!   state_transition   Closing → Importing → Imported
//!   delete(file)       file, its slices and their statistics
//! ```
//!
//! `rotate*` and `close*` are the only way into `Closing`: both need the
//! current time for the new file and the slices, which a generic transition
//! does not have.
//!
//! A sink has at most one file in the `Writing` state. Finding more is a
//! broken invariant and fails the operation.

use super::hook::{DiskSpaceEstimator, FileResource, Hook, ResourceRequest};
use super::{all_in, create, level_in, list, read, remove, update};
use crate::config::RepositoryConfig;
use crate::definition::{read_sink, read_sinks_in, Sink, Token};
use crate::error::{Result, StorageError};
use crate::schema::{definition as definition_keys, FILES};
use sinkhouse_core::{
    cascade_slice_state, validate_combination, File, FileKey, FileState, KeyPrefix, Level, Slice,
    SinkKey, UtcTime, VolumeId,
};
use sinkhouse_metadata::{AtomicOp, KvStore, Tx};
use sinkhouse_observability::metrics;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct FileRepository {
    store: Arc<dyn KvStore>,
    op: AtomicOp,
    hook: Arc<Hook>,
    config: RepositoryConfig,
}

impl FileRepository {
    pub fn new(store: Arc<dyn KvStore>, hook: Arc<Hook>, config: RepositoryConfig) -> Self {
        Self {
            op: AtomicOp::new(store.clone()).with_max_attempts(config.max_conflict_attempts),
            store,
            hook,
            config,
        }
    }

    pub async fn get(&self, key: &FileKey) -> Result<File> {
        match self.store.get(&FILES.all(key)).await? {
            Some(kv) => Ok(kv.decode()?),
            None => Err(StorageError::not_found("file", key)),
        }
    }

    pub async fn list_in(&self, parent: &impl KeyPrefix) -> Result<Vec<File>> {
        list(self.store.as_ref(), &all_in::<File>(parent)).await
    }

    pub async fn list_in_level(&self, parent: &impl KeyPrefix, level: Level) -> Result<Vec<File>> {
        list(self.store.as_ref(), &level_in::<File>(level, parent)).await
    }

    pub async fn list_in_state(
        &self,
        parent: &impl KeyPrefix,
        state: FileState,
    ) -> Result<Vec<File>> {
        let mut files = self.list_in_level(parent, state.level()).await?;
        files.retain(|f| f.state == state);
        Ok(files)
    }

    /// Newest files of the sink or any other parent, at most `limit`.
    pub async fn list_recent_in(
        &self,
        parent: &impl KeyPrefix,
        limit: usize,
    ) -> Result<Vec<File>> {
        let mut files = self.list_in(parent).await?;
        files.sort_by(|a, b| b.key.opened_at.cmp(&a.key.opened_at).then_with(|| a.key.cmp(&b.key)));
        files.truncate(limit);
        Ok(files)
    }

    /// Closes the opened file of the sink and opens a new one.
    pub async fn rotate(&self, now: UtcTime, sink_key: &SinkKey) -> Result<File> {
        self.rotate_sink("file.rotate", now, sink_key, None, None)
            .await?
            .ok_or_else(|| StorageError::Invalid(format!("sink \"{sink_key}\" was not rotated")))
    }

    /// Rotates the sink of `key` only while `key` is still its opened file.
    ///
    /// Returns `None` without side effects when the sink was rotated or
    /// closed in the meantime, e.g. by a decision made on stale data.
    pub async fn rotate_opened(&self, now: UtcTime, key: &FileKey) -> Result<Option<File>> {
        self.rotate_sink("file.rotate_opened", now, key.sink(), None, Some(key))
            .await
    }

    /// Same as [`rotate`](Self::rotate), with the sink definition given
    /// directly instead of read from the store.
    ///
    /// Used when a sink is created or modified, so the first file already
    /// follows the new columns and config.
    pub async fn rotate_on_sink_mod(&self, now: UtcTime, sink: &Sink) -> Result<File> {
        self.rotate_sink("file.rotate_on_sink_mod", now, &sink.key, Some(sink), None)
            .await?
            .ok_or_else(|| StorageError::Invalid(format!("sink \"{}\" was not rotated", sink.key)))
    }

    async fn rotate_sink(
        &self,
        name: &'static str,
        now: UtcTime,
        sink_key: &SinkKey,
        sink: Option<&Sink>,
        expected: Option<&FileKey>,
    ) -> Result<Option<File>> {
        let resources = self.hook.file_resources();
        let disk = self.hook.disk_space();
        let result = self
            .op
            .run(name, |tx| {
                let (resources, disk) = (&resources, &disk);
                async move {
                    let opened = opened_in(&tx, sink_key).await?;
                    if let Some(expected) = expected {
                        if opened.as_ref().map(|f| &f.key) != Some(expected) {
                            return Ok(None);
                        }
                    }
                    let sink = match sink {
                        Some(sink) => sink.clone(),
                        None => read_sink(&tx, sink_key).await?,
                    };
                    let token = read_token(&tx, sink_key).await?;
                    let volumes = self.hook.assign_volumes(&sink.config.assignment, now).await?;
                    let resource = resources
                        .get_or_create(&FileKey::new(sink_key.clone(), now), &sink, token.as_ref())
                        .await?;
                    if let Some(file) = &opened {
                        close_file_in(&tx, now, file).await?;
                    }
                    open_in(&tx, now, &sink, volumes, &resource, disk)
                        .await
                        .map(Some)
                }
            })
            .await;
        let file = resources.finish(result).await?;
        match &file {
            Some(file) => {
                metrics::FILE_ROTATIONS_TOTAL.with_label_values(&["rotated"]).inc();
                info!(
                    file = %file.key,
                    volumes = file.assignment.volumes.len(),
                    "file rotated"
                );
            }
            None => {
                metrics::FILE_ROTATIONS_TOTAL.with_label_values(&["skipped"]).inc();
                debug!(sink = %sink_key, "file rotation skipped, the opened file has changed");
            }
        }
        Ok(file)
    }

    /// Rotates every sink under `parent`, creating file resources in parallel.
    pub async fn rotate_all_in(
        &self,
        now: UtcTime,
        parent: &impl KeyPrefix,
    ) -> Result<Vec<File>> {
        let resources = self.hook.file_resources();
        let disk = self.hook.disk_space();
        let parent = parent.prefix();
        let result = self
            .op
            .run("file.rotate_all_in", |tx| {
                let (resources, disk, parent) = (&resources, &disk, &parent);
                async move {
                    let sinks = read_sinks_in(&tx, parent).await?;

                    let mut planned = Vec::with_capacity(sinks.len());
                    let mut requests = Vec::with_capacity(sinks.len());
                    for sink in sinks {
                        let token = read_token(&tx, &sink.key).await?;
                        let volumes = self.hook.assign_volumes(&sink.config.assignment, now).await?;
                        requests.push(ResourceRequest {
                            file_key: FileKey::new(sink.key.clone(), now),
                            sink: sink.clone(),
                            token,
                        });
                        planned.push((sink, volumes));
                    }
                    let mut created = resources.ensure(requests).await?;

                    let mut files = Vec::with_capacity(planned.len());
                    for (sink, volumes) in planned {
                        let key = FileKey::new(sink.key.clone(), now);
                        let resource = created.remove(&key).ok_or_else(|| {
                            StorageError::Invalid(format!(
                                "credentials for the sink \"{}\" was not provided",
                                sink.key
                            ))
                        })?;
                        close_opened_in(&tx, now, &sink.key).await?;
                        files.push(open_in(&tx, now, &sink, volumes, &resource, disk).await?);
                    }
                    Ok(files)
                }
            })
            .await;
        let files = resources.finish(result).await?;
        info!(parent = %parent, files = files.len(), "files rotated");
        Ok(files)
    }

    /// Moves the file and its writing slices to `Closing`.
    pub async fn close(&self, now: UtcTime, key: &FileKey) -> Result<File> {
        let file = self
            .op
            .run("file.close", |tx| async move {
                let file: File = read(&tx, key).await?;
                close_file_in(&tx, now, &file).await
            })
            .await?;
        info!(file = %file.key, "file closed");
        Ok(file)
    }

    /// Closes the opened file of the sink without opening a new one.
    pub async fn close_sink(&self, now: UtcTime, sink_key: &SinkKey) -> Result<Option<File>> {
        let closed = self
            .op
            .run("file.close_sink", |tx| async move {
                read_sink(&tx, sink_key).await?;
                close_opened_in(&tx, now, sink_key).await
            })
            .await?;
        if let Some(file) = &closed {
            info!(file = %file.key, "file closed");
        }
        Ok(closed)
    }

    /// Closes all opened files under `parent`.
    pub async fn close_all_in(
        &self,
        now: UtcTime,
        parent: &impl KeyPrefix,
    ) -> Result<Vec<File>> {
        let prefix = level_in::<File>(Level::Local, parent);
        let files = self
            .op
            .run("file.close_all_in", |tx| {
                let prefix = &prefix;
                async move {
                    let mut closed = Vec::new();
                    for file in tx.get_prefix_json::<File>(prefix).await? {
                        if file.state == FileState::Writing {
                            closed.push(close_file_in(&tx, now, &file).await?);
                        }
                    }
                    Ok::<_, StorageError>(closed)
                }
            })
            .await?;
        info!(files = files.len(), "files closed");
        Ok(files)
    }

    /// Moves the file from `from` to `to`.
    ///
    /// Slices follow the file where the state table requires it, and every
    /// slice must form a valid combination with the new file state.
    /// Statistics of the file move when the level changes.
    pub async fn state_transition(
        &self,
        now: UtcTime,
        key: &FileKey,
        from: FileState,
        to: FileState,
    ) -> Result<File> {
        if to == FileState::Closing {
            return Err(StorageError::BadRequest(
                "unexpected file transition to the state \"closing\", use Rotate* or Close* methods"
                    .into(),
            ));
        }

        let file = self
            .op
            .run("file.state_transition", |tx| async move {
                let file: File = read(&tx, key).await?;
                if file.state != from {
                    return Err(StorageError::BadRequest(format!(
                        "file \"{}\" is in \"{}\" state, expected \"{}\"",
                        key, file.state, from
                    )));
                }
                let updated = file.with_state(now, to)?;
                let slices = tx.get_prefix_json::<Slice>(&all_in::<Slice>(key)).await?;
                transit_slices(&tx, now, to, slices)?;
                update(&tx, &file, &updated)?;
                self.hook
                    .move_file_statistics(&tx, key, file.level(), updated.level())
                    .await?;
                Ok(updated)
            })
            .await?;
        let state = to.to_string();
        metrics::STATE_TRANSITIONS_TOTAL
            .with_label_values(&["file", state.as_str()])
            .inc();
        info!(file = %key, from = %from, to = %to, "file state changed");
        Ok(file)
    }

    /// Records a failed attempt and schedules the next one.
    pub async fn increment_retry(
        &self,
        now: UtcTime,
        key: &FileKey,
        reason: &str,
    ) -> Result<File> {
        let backoff = self.config.retry;
        let file = self
            .op
            .run("file.increment_retry", |tx| async move {
                let file: File = read(&tx, key).await?;
                let mut updated = file.clone();
                updated.retry.increment(&backoff, now, reason);
                update(&tx, &file, &updated)?;
                Ok::<_, StorageError>(updated)
            })
            .await?;
        debug!(
            file = %key,
            attempt = file.retry.retry_attempt,
            reason,
            "file retry incremented"
        );
        Ok(file)
    }

    /// Deletes the file, its slices and their statistics.
    pub async fn delete(&self, key: &FileKey) -> Result<()> {
        self.op
            .run("file.delete", |tx| async move {
                let file: File = read(&tx, key).await?;
                for slice in tx.get_prefix_json::<Slice>(&all_in::<Slice>(key)).await? {
                    remove(&tx, &slice);
                }
                remove(&tx, &file);
                self.hook.delete_file_statistics(&tx, key).await
            })
            .await?;
        info!(file = %key, "file deleted");
        Ok(())
    }
}

async fn read_token(tx: &Tx, sink: &SinkKey) -> Result<Option<Token>> {
    Ok(tx.get_json::<Token>(&definition_keys::token(sink)).await?)
}

/// The file of the sink in the `Writing` state, if any.
async fn opened_in(tx: &Tx, sink: &SinkKey) -> Result<Option<File>> {
    let mut opened: Vec<File> = tx
        .get_prefix_json::<File>(&level_in::<File>(Level::Local, sink))
        .await?
        .into_iter()
        .filter(|f| f.state == FileState::Writing)
        .collect();
    if opened.len() > 1 {
        return Err(StorageError::Invalid(format!(
            "unexpected state, found {} opened files in the sink \"{}\"",
            opened.len(),
            sink
        )));
    }
    Ok(opened.pop())
}

/// Closes the opened file of the sink, if any.
async fn close_opened_in(tx: &Tx, now: UtcTime, sink: &SinkKey) -> Result<Option<File>> {
    match opened_in(tx, sink).await? {
        Some(file) => Ok(Some(close_file_in(tx, now, &file).await?)),
        None => Ok(None),
    }
}

async fn close_file_in(tx: &Tx, now: UtcTime, file: &File) -> Result<File> {
    let closed = file.with_state(now, FileState::Closing)?;
    let slices = tx
        .get_prefix_json::<Slice>(&level_in::<Slice>(Level::Local, &file.key))
        .await?;
    transit_slices(tx, now, FileState::Closing, slices)?;
    update(tx, file, &closed)?;
    Ok(closed)
}

/// Applies the cascade of a file transition to its slices.
///
/// Only changed slices are written. Every slice, changed or not, must form a
/// valid combination with `file_to`.
fn transit_slices(tx: &Tx, now: UtcTime, file_to: FileState, slices: Vec<Slice>) -> Result<()> {
    for slice in slices {
        match cascade_slice_state(file_to, slice.state) {
            Some(next) => {
                let updated = slice.with_state(now, next)?;
                validate_combination(&slice.key.to_string(), file_to, updated.state)?;
                update(tx, &slice, &updated)?;
            }
            None => validate_combination(&slice.key.to_string(), file_to, slice.state)?,
        }
    }
    Ok(())
}

async fn open_in(
    tx: &Tx,
    now: UtcTime,
    sink: &Sink,
    volumes: Vec<VolumeId>,
    resource: &FileResource,
    disk: &DiskSpaceEstimator,
) -> Result<File> {
    let file = File::new(
        FileKey::new(sink.key.clone(), now),
        &sink.config,
        sink.columns.clone(),
        volumes,
        resource.credentials.clone(),
        sink.table_id.clone(),
    );
    create(tx, &file).await?;

    let allocated = disk
        .for_sink(&sink.key, &sink.config.local.disk_alloc)
        .await?;
    for volume_id in &file.assignment.volumes {
        let slice = Slice::new(&file, volume_id.clone(), now, allocated);
        create(tx, &slice).await?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::repository::fixtures::{put_volumes, setup, sink, sink_key, source_key, volume};
    use sinkhouse_core::time::must_parse;
    use sinkhouse_core::{Column, SliceState};

    #[tokio::test]
    async fn test_rotate_opens_file_and_slices() {
        let f = setup().await;
        put_volumes(f.store.as_ref(), &[volume("my-volume-2", "node-2")]).await;
        let sink = sink_key("my-sink");

        let mut config = f.repo.definitions.get_sink(&sink).await.unwrap();
        config.config.assignment.count = 2;
        f.repo.definitions.update_sink(config).await.unwrap();

        let t1 = must_parse("2000-01-01T01:00:00.000Z");
        let file = f.repo.files.rotate(t1, &sink).await.unwrap();
        assert_eq!(file.state, FileState::Writing);
        assert_eq!(file.assignment.volumes.len(), 2);

        let slices = f.repo.slices.list_in(&file.key).await.unwrap();
        assert_eq!(slices.len(), 2);
        assert!(slices.iter().all(|s| s.state == SliceState::Writing));
        assert!(slices
            .iter()
            .all(|s| s.local_storage.allocated_disk_space == sinkhouse_core::ByteSize::mb(100)));

        let t2 = must_parse("2000-01-01T02:00:00.000Z");
        let second = f.repo.files.rotate(t2, &sink).await.unwrap();
        let old = f.repo.files.get(&file.key).await.unwrap();
        assert_eq!(old.state, FileState::Closing);
        assert_eq!(old.closing_at, Some(t2));
        for slice in f.repo.slices.list_in(&file.key).await.unwrap() {
            assert_eq!(slice.state, SliceState::Closing);
        }

        let writing = f
            .repo
            .files
            .list_in_state(&sink, FileState::Writing)
            .await
            .unwrap();
        assert_eq!(writing.len(), 1);
        assert_eq!(writing[0].key, second.key);
        assert_eq!(f.provider.created_count(), 2);
    }

    #[tokio::test]
    async fn test_rotate_missing_parents() {
        let f = setup().await;
        let now = must_parse("2000-01-01T01:00:00.000Z");

        let err = f
            .repo
            .files
            .rotate(now, &sink_key("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            err.to_string(),
            "sink \"123/456/my-source/missing\" not found"
        );
    }

    #[tokio::test]
    async fn test_rotate_same_time_already_exists() {
        let f = setup().await;
        let sink = sink_key("my-sink");
        let now = must_parse("2000-01-01T01:00:00.000Z");
        f.repo.files.rotate(now, &sink).await.unwrap();

        let err = f.repo.files.rotate(now, &sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        // Nothing changed.
        let files = f.repo.files.list_in(&sink).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].state, FileState::Writing);
    }

    #[tokio::test]
    async fn test_rotate_all_in() {
        let f = setup().await;
        f.repo.definitions.create_sink(sink("other-sink")).await.unwrap();
        let now = must_parse("2000-01-01T01:00:00.000Z");

        let files = f.repo.files.rotate_all_in(now, &source_key()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(f.provider.created_count(), 2);

        let closed = f
            .repo
            .files
            .close_all_in(must_parse("2000-01-01T02:00:00.000Z"), &source_key())
            .await
            .unwrap();
        assert_eq!(closed.len(), 2);
        assert!(f
            .repo
            .files
            .list_in_state(&source_key(), FileState::Writing)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_close_sink() {
        let f = setup().await;
        let sink = sink_key("my-sink");
        assert!(f
            .repo
            .files
            .close_sink(must_parse("2000-01-01T01:00:00.000Z"), &sink)
            .await
            .unwrap()
            .is_none());

        let file = f
            .repo
            .files
            .rotate(must_parse("2000-01-01T01:00:00.000Z"), &sink)
            .await
            .unwrap();
        let closed = f
            .repo
            .files
            .close_sink(must_parse("2000-01-01T02:00:00.000Z"), &sink)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.key, file.key);
        assert_eq!(closed.state, FileState::Closing);
    }

    #[tokio::test]
    async fn test_transition_errors() {
        let f = setup().await;
        let now = must_parse("2000-01-01T01:00:00.000Z");
        let file = f.repo.files.rotate(now, &sink_key("my-sink")).await.unwrap();

        let err = f
            .repo
            .files
            .state_transition(now, &file.key, FileState::Writing, FileState::Closing)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected file transition to the state \"closing\", use Rotate* or Close* methods"
        );

        let err = f
            .repo
            .files
            .state_transition(now, &file.key, FileState::Closing, FileState::Importing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(
            err.to_string(),
            format!("file \"{}\" is in \"writing\" state, expected \"closing\"", file.key)
        );

        // Slices are not uploaded yet.
        f.repo.files.close(now, &file.key).await.unwrap();
        let err = f
            .repo
            .files
            .state_transition(now, &file.key, FileState::Closing, FileState::Importing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(err
            .to_string()
            .contains("unexpected combination: file state \"importing\" and slice state \"closing\""));
    }

    #[tokio::test]
    async fn test_increment_retry_and_reset() {
        let f = setup().await;
        let t1 = must_parse("2000-01-01T01:00:00.000Z");
        let file = f.repo.files.rotate(t1, &sink_key("my-sink")).await.unwrap();

        let t2 = must_parse("2000-01-01T02:00:00.000Z");
        let file = f
            .repo
            .files
            .increment_retry(t2, &file.key, "import failed")
            .await
            .unwrap();
        assert_eq!(file.retry.retry_attempt, 1);
        assert_eq!(file.retry.retry_reason.as_deref(), Some("import failed"));
        assert_eq!(
            file.retry.retry_after,
            Some(must_parse("2000-01-01T02:02:00.000Z"))
        );

        let closed = f.repo.files.close(t2, &file.key).await.unwrap();
        assert_eq!(closed.retry.retry_attempt, 0);
        assert_eq!(closed.retry.retry_after, None);
    }

    #[tokio::test]
    async fn test_delete() {
        let f = setup().await;
        let file = f
            .repo
            .files
            .rotate(must_parse("2000-01-01T01:00:00.000Z"), &sink_key("my-sink"))
            .await
            .unwrap();

        f.repo.files.delete(&file.key).await.unwrap();
        assert_eq!(
            f.repo.files.get(&file.key).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(f.repo.slices.list_in(&file.key).await.unwrap().is_empty());

        let keys = f.store.keys().await;
        assert!(keys.iter().all(|k| !k.starts_with("storage/file/")), "{keys:?}");
        assert!(keys.iter().all(|k| !k.starts_with("storage/slice/")), "{keys:?}");

        let err = f.repo.files.delete(&file.key).await.unwrap_err();
        assert_eq!(err.to_string(), format!("file \"{}\" not found", file.key));
    }

    #[tokio::test]
    async fn test_rotate_opened_skips_stale_file() {
        let f = setup().await;
        let sink = sink_key("my-sink");
        let t1 = must_parse("2000-01-01T01:00:00.000Z");
        let first = f.repo.files.rotate(t1, &sink).await.unwrap();

        let t2 = must_parse("2000-01-01T02:00:00.000Z");
        let second = f
            .repo
            .files
            .rotate_opened(t2, &first.key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.key.opened_at, t2);
        assert_eq!(f.provider.created_count(), 2);

        // The first file is no longer opened, nothing happens.
        let t3 = must_parse("2000-01-01T03:00:00.000Z");
        assert!(f
            .repo
            .files
            .rotate_opened(t3, &first.key)
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.provider.created_count(), 2);
        let writing = f
            .repo
            .files
            .list_in_state(&sink, FileState::Writing)
            .await
            .unwrap();
        assert_eq!(writing.len(), 1);
        assert_eq!(writing[0].key, second.key);
    }

    #[tokio::test]
    async fn test_rotate_on_sink_mod_uses_given_sink() {
        let f = setup().await;
        let mut modified = sink("my-sink");
        modified.columns.push(Column::new("headers"));

        let now = must_parse("2000-01-01T01:00:00.000Z");
        let file = f.repo.files.rotate_on_sink_mod(now, &modified).await.unwrap();
        assert_eq!(file.columns.len(), 3);
        assert_eq!(file.columns[2].name, "headers");

        // The stored definition was not read.
        let stored = f.repo.definitions.get_sink(&modified.key).await.unwrap();
        assert_eq!(stored.columns.len(), 2);
    }

    #[tokio::test]
    async fn test_list_recent_in() {
        let f = setup().await;
        let sink = sink_key("my-sink");
        for hour in 1..=4 {
            let now = must_parse(&format!("2000-01-01T0{hour}:00:00.000Z"));
            f.repo.files.rotate(now, &sink).await.unwrap();
        }

        let recent = f.repo.files.list_recent_in(&sink, 3).await.unwrap();
        let opened: Vec<String> = recent.iter().map(|f| f.key.opened_at.to_string()).collect();
        assert_eq!(
            opened,
            vec![
                "2000-01-01T04:00:00.000Z",
                "2000-01-01T03:00:00.000Z",
                "2000-01-01T02:00:00.000Z",
            ]
        );
        assert_eq!(recent[0].state, FileState::Writing);
    }
}
