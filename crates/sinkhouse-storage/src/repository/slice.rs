//! Slice repository
//!
//! A slice is the part of a file written to one volume. Slices are rotated
//! independently of their file, e.g. when the upload conditions of one
//! volume are met:
//!
//! ```text
//!   file (Writing)
//!     └── volume vol-1
//!           ├── slice 01:00  Writing ──rotate──► Closing ──► Uploading ──► Uploaded
//!           └── slice 01:10  Writing
//! ```
//!
//! Every transition is checked against the state of the file, see
//! [`validate_combination`].

use super::hook::Hook;
use super::{all_in, create, level_in, list, read, remove, update};
use crate::config::RepositoryConfig;
use crate::error::{Result, StorageError};
use crate::schema::SLICES;
use sinkhouse_core::{
    validate_combination, File, FileState, FileVolumeKey, KeyPrefix, Level, Slice, SliceKey,
    SliceState, UtcTime,
};
use sinkhouse_metadata::{AtomicOp, KvStore, Tx};
use sinkhouse_observability::metrics;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct SliceRepository {
    store: Arc<dyn KvStore>,
    op: AtomicOp,
    hook: Arc<Hook>,
    config: RepositoryConfig,
}

impl SliceRepository {
    pub fn new(store: Arc<dyn KvStore>, hook: Arc<Hook>, config: RepositoryConfig) -> Self {
        Self {
            op: AtomicOp::new(store.clone()).with_max_attempts(config.max_conflict_attempts),
            store,
            hook,
            config,
        }
    }

    pub async fn get(&self, key: &SliceKey) -> Result<Slice> {
        match self.store.get(&SLICES.all(key)).await? {
            Some(kv) => Ok(kv.decode()?),
            None => Err(StorageError::not_found("slice", key)),
        }
    }

    pub async fn list_in(&self, parent: &impl KeyPrefix) -> Result<Vec<Slice>> {
        list(self.store.as_ref(), &all_in::<Slice>(parent)).await
    }

    pub async fn list_in_level(
        &self,
        parent: &impl KeyPrefix,
        level: Level,
    ) -> Result<Vec<Slice>> {
        list(self.store.as_ref(), &level_in::<Slice>(level, parent)).await
    }

    pub async fn list_in_state(
        &self,
        parent: &impl KeyPrefix,
        state: SliceState,
    ) -> Result<Vec<Slice>> {
        let mut slices = self.list_in_level(parent, state.level()).await?;
        slices.retain(|s| s.state == state);
        Ok(slices)
    }

    /// Closes the writing slice in the volume and opens a new one.
    pub async fn rotate(&self, now: UtcTime, key: &FileVolumeKey) -> Result<Slice> {
        self.rotate_volume("slice.rotate", now, key, None)
            .await?
            .ok_or_else(|| StorageError::Invalid(format!("volume \"{key}\" was not rotated")))
    }

    /// Rotates the volume of `key` only while `key` is still its writing slice.
    ///
    /// Returns `None` without side effects when the slice was rotated or
    /// closed in the meantime.
    pub async fn rotate_opened(&self, now: UtcTime, key: &SliceKey) -> Result<Option<Slice>> {
        self.rotate_volume("slice.rotate_opened", now, key.file_volume(), Some(key))
            .await
    }

    async fn rotate_volume(
        &self,
        name: &'static str,
        now: UtcTime,
        key: &FileVolumeKey,
        expected: Option<&SliceKey>,
    ) -> Result<Option<Slice>> {
        let disk = self.hook.disk_space();
        let slice = self
            .op
            .run(name, |tx| {
                let disk = &disk;
                async move {
                    let opened = opened_in(&tx, key).await?;
                    if let Some(expected) = expected {
                        if opened.iter().all(|s| &s.key != expected) {
                            return Ok(None);
                        }
                    }

                    let file: File = read(&tx, key.file()).await?;
                    if file.state != FileState::Writing {
                        return Err(StorageError::BadRequest(format!(
                            "slice cannot be created: unexpected file \"{}\" state \"{}\", expected \"writing\"",
                            file.key, file.state
                        )));
                    }
                    if !file.assignment.volumes.contains(&key.volume_id) {
                        return Err(StorageError::BadRequest(format!(
                            "slice cannot be created: volume \"{}\" is not assigned to the file \"{}\"",
                            key.volume_id, file.key
                        )));
                    }

                    close_all(&tx, now, &file, opened)?;

                    let allocated = disk
                        .for_sink(file.key.sink(), &file.local_storage.config.disk_alloc)
                        .await?;
                    let slice = Slice::new(&file, key.volume_id.clone(), now, allocated);
                    create(&tx, &slice).await?;
                    Ok(Some(slice))
                }
            })
            .await?;
        match &slice {
            Some(slice) => {
                metrics::SLICE_ROTATIONS_TOTAL.with_label_values(&["rotated"]).inc();
                info!(slice = %slice.key, "slice rotated");
            }
            None => {
                metrics::SLICE_ROTATIONS_TOTAL.with_label_values(&["skipped"]).inc();
                debug!(volume = %key, "slice rotation skipped, the opened slice has changed");
            }
        }
        Ok(slice)
    }

    /// Closes the writing slice in the volume without opening a new one.
    pub async fn close(&self, now: UtcTime, key: &FileVolumeKey) -> Result<Option<Slice>> {
        let closed = self
            .op
            .run("slice.close", |tx| async move {
                let file: File = read(&tx, key.file()).await?;
                close_opened_in(&tx, now, &file, key).await
            })
            .await?;
        if let Some(slice) = &closed {
            info!(slice = %slice.key, "slice closed");
        }
        Ok(closed)
    }

    /// Moves the slice from `from` to `to`, statistics follow on a level change.
    ///
    /// A slice already moved to `Imported` together with its file accepts
    /// `Uploaded → Imported` again without writing anything.
    pub async fn state_transition(
        &self,
        now: UtcTime,
        key: &SliceKey,
        from: SliceState,
        to: SliceState,
    ) -> Result<Slice> {
        if to == SliceState::Closing {
            return Err(StorageError::BadRequest(
                "unexpected transition to the state \"closing\", use Rotate or Close method"
                    .into(),
            ));
        }

        let slice = self
            .op
            .run("slice.state_transition", |tx| async move {
                let slice: Slice = read(&tx, key).await?;
                let file: File = read(&tx, key.file()).await?;

                if slice.state == SliceState::Imported && to == SliceState::Imported {
                    return Ok(slice);
                }
                if slice.state != from {
                    return Err(StorageError::BadRequest(format!(
                        "slice \"{}\" is in \"{}\" state, expected \"{}\"",
                        key, slice.state, from
                    )));
                }

                let updated = slice.with_state(now, to)?;
                validate_combination(&key.to_string(), file.state, to)?;
                update(&tx, &slice, &updated)?;
                self.hook
                    .move_slice_statistics(&tx, key, slice.level(), updated.level())
                    .await?;
                Ok(updated)
            })
            .await?;
        let state = to.to_string();
        metrics::STATE_TRANSITIONS_TOTAL
            .with_label_values(&["slice", state.as_str()])
            .inc();
        info!(slice = %key, from = %from, to = %to, "slice state changed");
        Ok(slice)
    }

    /// Records a failed upload attempt and schedules the next one.
    pub async fn increment_retry(
        &self,
        now: UtcTime,
        key: &SliceKey,
        reason: &str,
    ) -> Result<Slice> {
        let backoff = self.config.retry;
        let slice = self
            .op
            .run("slice.increment_retry", |tx| async move {
                let slice: Slice = read(&tx, key).await?;
                let mut updated = slice.clone();
                updated.retry.increment(&backoff, now, reason);
                update(&tx, &slice, &updated)?;
                Ok::<_, StorageError>(updated)
            })
            .await?;
        debug!(
            slice = %key,
            attempt = slice.retry.retry_attempt,
            reason,
            "slice retry incremented"
        );
        Ok(slice)
    }

    /// Deletes the slice and its statistics.
    pub async fn delete(&self, key: &SliceKey) -> Result<()> {
        self.op
            .run("slice.delete", |tx| async move {
                let slice: Slice = read(&tx, key).await?;
                remove(&tx, &slice);
                self.hook.delete_slice_statistics(&tx, key).await
            })
            .await?;
        info!(slice = %key, "slice deleted");
        Ok(())
    }
}

/// Writing slices of the volume, normally at most one.
async fn opened_in(tx: &Tx, key: &FileVolumeKey) -> Result<Vec<Slice>> {
    Ok(tx
        .get_prefix_json::<Slice>(&level_in::<Slice>(Level::Local, key))
        .await?
        .into_iter()
        .filter(|s| s.state == SliceState::Writing)
        .collect())
}

/// Closes the writing slice of the file in the volume, if any.
async fn close_opened_in(
    tx: &Tx,
    now: UtcTime,
    file: &File,
    key: &FileVolumeKey,
) -> Result<Option<Slice>> {
    let opened = opened_in(tx, key).await?;
    close_all(tx, now, file, opened)
}

fn close_all(tx: &Tx, now: UtcTime, file: &File, opened: Vec<Slice>) -> Result<Option<Slice>> {
    let mut closed = None;
    for slice in opened {
        let updated = slice.with_state(now, SliceState::Closing)?;
        validate_combination(&slice.key.to_string(), file.state, updated.state)?;
        update(tx, &slice, &updated)?;
        closed = Some(updated);
    }
    Ok(closed)
}
