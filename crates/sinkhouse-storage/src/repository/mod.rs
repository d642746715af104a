//! File and slice repositories
//!
//! Every mutating operation is an [`AtomicOp`](sinkhouse_metadata::AtomicOp):
//!
//! ```text
//!   read phase     load entities, parents and statistics through the Tx
//!   check phase    state machine, combination table, parents exist
//!   write phase    both copies of each entity + statistics moves
//!   commit         guarded by the revisions of everything read
//! ```
//!
//! A conflicting writer makes the commit fail, and the operation runs again
//! from the read phase. Callers never see the conflict.
//!
//! ## Entity copies
//!
//! Each entity is stored under `all` and under its current level. The
//! helpers below are the only code writing those keys, so both copies are
//! always updated together:
//!
//! - `create` fails with `AlreadyExists` if the `all` key is present,
//! - `update` drops the old level copy when the level changed,
//! - `remove` deletes both copies.

pub mod file;
pub mod hook;
pub mod slice;

#[cfg(test)]
pub(crate) mod fixtures;

pub use file::FileRepository;
pub use hook::{
    DiskSpaceEstimator, FileImporter, FileResource, FileResourceProvider, FileResources, Hook,
    ResourceRequest, SliceUploader,
};
pub use slice::SliceRepository;

use crate::config::RepositoryConfig;
use crate::definition::DefinitionRepository;
use crate::error::{Result, StorageError};
use crate::schema::{EntitySchema, FILES, SLICES};
use crate::statistics::StatisticsRepository;
use crate::volume::VolumeRegistry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sinkhouse_core::{File, FileKey, KeyPrefix, Level, Slice, SliceKey};
use sinkhouse_metadata::{KvStore, Tx};
use std::fmt::Display;
use std::sync::Arc;

/// An entity stored in both the `all` and the level namespace.
pub(crate) trait Entity: Serialize + DeserializeOwned + Send + Sync {
    type Key: Display + Send + Sync;

    const NAME: &'static str;
    const SCHEMA: EntitySchema;

    fn key(&self) -> &Self::Key;
    fn level(&self) -> Level;
}

impl Entity for File {
    type Key = FileKey;

    const NAME: &'static str = "file";
    const SCHEMA: EntitySchema = FILES;

    fn key(&self) -> &FileKey {
        &self.key
    }

    fn level(&self) -> Level {
        self.state.level()
    }
}

impl Entity for Slice {
    type Key = SliceKey;

    const NAME: &'static str = "slice";
    const SCHEMA: EntitySchema = SLICES;

    fn key(&self) -> &SliceKey {
        &self.key
    }

    fn level(&self) -> Level {
        self.state.level()
    }
}

pub(crate) async fn read<E: Entity>(tx: &Tx, key: &E::Key) -> Result<E> {
    match tx.get_json::<E>(&E::SCHEMA.all(key)).await? {
        Some(entity) => Ok(entity),
        None => Err(StorageError::not_found(E::NAME, key)),
    }
}

pub(crate) async fn create<E: Entity>(tx: &Tx, entity: &E) -> Result<()> {
    let key = E::SCHEMA.all(entity.key());
    if tx.exists(&key).await? {
        return Err(StorageError::already_exists(E::NAME, entity.key()));
    }
    tx.put_json(key, entity)?;
    tx.put_json(E::SCHEMA.in_level(entity.level(), entity.key()), entity)?;
    Ok(())
}

pub(crate) fn update<E: Entity>(tx: &Tx, old: &E, new: &E) -> Result<()> {
    if old.level() != new.level() {
        tx.delete(E::SCHEMA.in_level(old.level(), old.key()));
    }
    tx.put_json(E::SCHEMA.all(new.key()), new)?;
    tx.put_json(E::SCHEMA.in_level(new.level(), new.key()), new)?;
    Ok(())
}

pub(crate) fn remove<E: Entity>(tx: &Tx, entity: &E) {
    tx.delete(E::SCHEMA.all(entity.key()));
    tx.delete(E::SCHEMA.in_level(entity.level(), entity.key()));
}

/// Non-transactional listing helpers shared by both repositories.
pub(crate) async fn list<E: Entity>(store: &dyn KvStore, prefix: &str) -> Result<Vec<E>> {
    let resp = store.get_prefix(prefix).await?;
    resp.kvs
        .iter()
        .map(|kv| kv.decode().map_err(StorageError::from))
        .collect()
}

pub(crate) fn all_in<E: Entity>(parent: &impl KeyPrefix) -> String {
    E::SCHEMA.all_in(parent)
}

pub(crate) fn level_in<E: Entity>(level: Level, parent: &impl KeyPrefix) -> String {
    E::SCHEMA.in_level_in(level, parent)
}

/// All storage repositories over one metadata store.
#[derive(Clone)]
pub struct Repository {
    pub definitions: DefinitionRepository,
    pub statistics: StatisticsRepository,
    pub volumes: VolumeRegistry,
    pub files: FileRepository,
    pub slices: SliceRepository,
}

impl Repository {
    pub fn new(
        store: Arc<dyn KvStore>,
        resources: Arc<dyn FileResourceProvider>,
        config: RepositoryConfig,
    ) -> Self {
        let definitions = DefinitionRepository::new(store.clone());
        let statistics = StatisticsRepository::new(store.clone());
        let volumes = VolumeRegistry::new(store.clone());
        let hook = Arc::new(Hook::new(
            volumes.clone(),
            statistics.clone(),
            resources,
            config.clone(),
        ));
        Self {
            files: FileRepository::new(store.clone(), hook.clone(), config.clone()),
            slices: SliceRepository::new(store, hook, config),
            definitions,
            statistics,
            volumes,
        }
    }
}
