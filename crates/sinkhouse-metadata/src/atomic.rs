//! Optimistic atomic operations
//!
//! An `AtomicOp` runs a closure that reads from the store and buffers writes
//! through a `Tx` handle. Every read is remembered as a compare:
//!
//! - a single key read records `mod_revision(key) == seen` (0 when missing),
//! - a prefix read records that nothing under the prefix was added, removed
//!   or modified after the snapshot revision.
//!
//! When the closure returns `Ok`, all buffered writes are committed in one
//! transaction guarded by those compares. If another writer touched any of
//! the read keys in between, the commit fails and the whole closure runs
//! again against fresh data.
//!
//! ```text
//!   attempt 1:  read a@7, read prefix p/@9 ──► buffer writes ──► txn ✗ (a@8)
//!   attempt 2:  read a@8, read prefix p/@9 ──► buffer writes ──► txn ✓
//! ```
//!
//! The closure must be free of side effects outside the `Tx`, since it can
//! run several times. Errors returned by the closure abort the operation
//! without writing anything.

use crate::error::{MetadataError, Result};
use crate::kv::{encode, Compare, CompareOp, KeyValue, KvStore, Op, Txn};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sinkhouse_observability::metrics;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
const RETRY_DELAY: Duration = Duration::from_millis(5);

#[derive(Default)]
struct TxState {
    compares: Vec<Compare>,
    ops: Vec<Op>,
}

/// Read/write handle passed to the closure of an atomic operation.
///
/// Cheap to clone; all clones share the same read set and write buffer.
#[derive(Clone)]
pub struct Tx {
    store: Arc<dyn KvStore>,
    state: Arc<Mutex<TxState>>,
}

impl Tx {
    fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(TxState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let kv = self.store.get(key).await?;
        let revision = kv.as_ref().map_or(0, |kv| kv.mod_revision);
        self.when(Compare::mod_revision(key, CompareOp::Equal, revision));
        Ok(kv)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key).await?.map(|kv| kv.decode()).transpose()
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let resp = self.store.get_prefix(prefix).await?;
        self.when(Compare::PrefixUnchanged {
            prefix: prefix.to_string(),
            revision: resp.revision,
            count: resp.kvs.len(),
        });
        Ok(resp.kvs)
    }

    pub async fn get_prefix_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.get_prefix(prefix)
            .await?
            .iter()
            .map(|kv| kv.decode())
            .collect()
    }

    pub fn put(&self, key: impl Into<String>, value: Bytes) {
        self.lock().ops.push(Op::put(key, value));
    }

    pub fn put_json<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = encode(value)?;
        self.put(key, value);
        Ok(())
    }

    pub fn delete(&self, key: impl Into<String>) {
        self.lock().ops.push(Op::delete(key));
    }

    pub fn delete_prefix(&self, prefix: impl Into<String>) {
        self.lock().ops.push(Op::delete_prefix(prefix));
    }

    /// Adds an extra compare to the commit.
    pub fn when(&self, compare: Compare) {
        self.lock().compares.push(compare);
    }

    /// Number of buffered write ops.
    pub fn ops_count(&self) -> usize {
        self.lock().ops.len()
    }

    async fn commit(&self) -> Result<bool> {
        let txn = {
            let mut state = self.lock();
            if state.ops.is_empty() {
                // Read-only operations have nothing to protect.
                return Ok(true);
            }
            Txn::new()
                .when(std::mem::take(&mut state.compares))
                .and_then(std::mem::take(&mut state.ops))
        };
        Ok(self.store.txn(txn).await?.succeeded)
    }
}

/// Runs closures as optimistic transactions with retries on conflict.
#[derive(Clone)]
pub struct AtomicOp {
    store: Arc<dyn KvStore>,
    max_attempts: u32,
}

impl AtomicOp {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Runs `f` until its writes commit without conflict.
    ///
    /// The error type is the caller's, so closures can return domain errors
    /// directly. Store errors are converted with `From<MetadataError>`.
    pub async fn run<T, E, F, Fut>(&self, name: &str, mut f: F) -> std::result::Result<T, E>
    where
        F: FnMut(Tx) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<MetadataError>,
    {
        for attempt in 1..=self.max_attempts {
            let tx = Tx::new(self.store.clone());
            let value = f(tx.clone()).await?;
            if tx.commit().await? {
                if attempt > 1 {
                    debug!(operation = name, attempt, "atomic operation committed after retry");
                }
                return Ok(value);
            }
            metrics::ATOMIC_OP_CONFLICTS_TOTAL
                .with_label_values(&[name])
                .inc();
            debug!(operation = name, attempt, "atomic operation conflict, retrying");
            tokio::time::sleep(RETRY_DELAY).await;
        }

        metrics::ATOMIC_OP_EXHAUSTED_TOTAL
            .with_label_values(&[name])
            .inc();
        warn!(
            operation = name,
            attempts = self.max_attempts,
            "atomic operation gave up"
        );
        Err(MetadataError::TooManyConflicts {
            operation: name.to_string(),
            attempts: self.max_attempts,
        }
        .into())
    }
}
