//! Watch-driven in-memory mirror of a key prefix
//!
//! A `Mirror` keeps a local copy of every value under a prefix, decoded and
//! filtered by a mapper. Reads are synchronous and never touch the store,
//! which lets periodic checks scan thousands of entities cheaply.
//!
//! ## Consistency
//!
//! ```text
//!   1. subscribe watch(prefix)          events buffered from here on
//!   2. snapshot get_prefix(prefix)@R     full state at revision R
//!   3. apply buffered events with revision > R, then follow the stream
//! ```
//!
//! Subscribing before the snapshot guarantees no change is missed. If the
//! watcher lags behind, the mirror takes a fresh snapshot.
//!
//! ## Filtering
//!
//! The mapper returns `None` for entries the mirror should not hold (for
//! example entities owned by another node). A put mapped to `None` removes
//! the key, so an entity leaving the filter disappears from the mirror. When
//! the filter itself changes, call [`Mirror::restart`] to rebuild the
//! contents from a new snapshot.

use crate::error::{MetadataError, Result};
use crate::kv::{EventKind, KeyValue, KvStore, Revision, WatchStream};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RESYNC_BACKOFF: Duration = Duration::from_millis(500);

pub type Mapper<V> = Arc<dyn Fn(&KeyValue) -> Option<V> + Send + Sync>;

/// Mapper decoding JSON values and keeping only those matching `filter`.
///
/// Undecodable values are logged and skipped.
pub fn json_mapper<T, P>(filter: P) -> Mapper<T>
where
    T: DeserializeOwned + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(move |kv: &KeyValue| match kv.decode::<T>() {
        Ok(value) if filter(&value) => Some(value),
        Ok(_) => None,
        Err(e) => {
            warn!(key = %kv.key, error = %e, "mirror skipped undecodable value");
            None
        }
    })
}

struct Contents<V> {
    revision: Revision,
    items: BTreeMap<String, V>,
}

struct Shared<V> {
    prefix: String,
    store: Arc<dyn KvStore>,
    mapper: Mapper<V>,
    contents: RwLock<Contents<V>>,
    revision_tx: watch::Sender<Revision>,
    restart: Notify,
}

impl<V> Shared<V> {
    fn read(&self) -> RwLockReadGuard<'_, Contents<V>> {
        self.contents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Contents<V>> {
        self.contents.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribes, snapshots and replaces the contents.
    async fn sync(&self) -> Result<WatchStream> {
        let stream = self.store.watch_prefix(&self.prefix).await?;
        let snapshot = self.store.get_prefix(&self.prefix).await?;

        let items = snapshot
            .kvs
            .iter()
            .filter_map(|kv| (self.mapper)(kv).map(|v| (kv.key.clone(), v)))
            .collect::<BTreeMap<_, _>>();
        let count = items.len();
        {
            let mut contents = self.write();
            contents.items = items;
            contents.revision = snapshot.revision;
        }
        self.revision_tx.send_replace(snapshot.revision);
        debug!(
            prefix = %self.prefix,
            revision = snapshot.revision,
            count,
            "mirror synced"
        );
        Ok(stream)
    }

    async fn sync_until_ok(&self) -> WatchStream {
        loop {
            match self.sync().await {
                Ok(stream) => return stream,
                Err(e) => {
                    warn!(prefix = %self.prefix, error = %e, "mirror sync failed, retrying");
                    tokio::time::sleep(RESYNC_BACKOFF).await;
                }
            }
        }
    }

    fn apply(&self, revision: Revision, events: &[crate::kv::WatchEvent]) {
        {
            let mut contents = self.write();
            if revision <= contents.revision {
                return;
            }
            for event in events {
                let key = &event.kv.key;
                match event.kind {
                    EventKind::Put => match (self.mapper)(&event.kv) {
                        Some(value) => {
                            contents.items.insert(key.clone(), value);
                        }
                        None => {
                            contents.items.remove(key);
                        }
                    },
                    EventKind::Delete => {
                        contents.items.remove(key);
                    }
                }
            }
            contents.revision = revision;
        }
        self.revision_tx.send_replace(revision);
    }

    async fn run(self: Arc<Self>, mut stream: WatchStream) {
        loop {
            tokio::select! {
                _ = self.restart.notified() => {
                    info!(prefix = %self.prefix, "mirror restarting");
                    stream = self.sync_until_ok().await;
                }
                next = stream.next() => match next {
                    Some(Ok(resp)) => self.apply(resp.revision, &resp.events),
                    Some(Err(MetadataError::WatchLagged(n))) => {
                        warn!(prefix = %self.prefix, lagged = n, "mirror watch lagged, resyncing");
                        stream = self.sync_until_ok().await;
                    }
                    Some(Err(e)) => {
                        warn!(prefix = %self.prefix, error = %e, "mirror watch failed, resyncing");
                        stream = self.sync_until_ok().await;
                    }
                    None => {
                        debug!(prefix = %self.prefix, "mirror watch closed");
                        return;
                    }
                },
            }
        }
    }
}

/// Local, continuously updated copy of a prefix.
pub struct Mirror<V> {
    shared: Arc<Shared<V>>,
    revision_rx: watch::Receiver<Revision>,
    task: JoinHandle<()>,
}

impl<V> Mirror<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Takes the initial snapshot and starts following changes.
    ///
    /// Returns once the mirror holds the state at the snapshot revision.
    pub async fn start(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        mapper: Mapper<V>,
    ) -> Result<Self> {
        let (revision_tx, revision_rx) = watch::channel(0);
        let shared = Arc::new(Shared {
            prefix: prefix.into(),
            store,
            mapper,
            contents: RwLock::new(Contents {
                revision: 0,
                items: BTreeMap::new(),
            }),
            revision_tx,
            restart: Notify::new(),
        });
        let stream = shared.sync().await?;
        let task = tokio::spawn(shared.clone().run(stream));
        Ok(Self {
            shared,
            revision_rx,
            task,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.shared.prefix
    }

    /// Revision of the last applied change.
    pub fn revision(&self) -> Revision {
        self.shared.read().revision
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.shared.read().items.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.read().items.is_empty()
    }

    /// All values in key order.
    pub fn values(&self) -> Vec<V> {
        self.shared.read().items.values().cloned().collect()
    }

    /// Values whose raw key starts with `prefix`.
    pub fn values_in(&self, prefix: &str) -> Vec<V> {
        self.shared
            .read()
            .items
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Rebuilds the contents from a fresh snapshot, re-running the mapper on
    /// every entry.
    pub fn restart(&self) {
        self.shared.restart.notify_one();
    }

    /// Waits until a change at `revision` or later under the prefix has been
    /// applied.
    pub async fn wait_for_revision(&self, revision: Revision) {
        let mut rx = self.revision_rx.clone();
        // The sender lives in `shared`, which outlives this call.
        let _ = rx.wait_for(|r| *r >= revision).await;
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl<V> Drop for Mirror<V> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
