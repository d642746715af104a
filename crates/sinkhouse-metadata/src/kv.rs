//! Revisioned key-value store
//!
//! The pipeline keeps all of its shared state in a strongly consistent,
//! revisioned key-value store with etcd semantics:
//!
//! - Every committed write bumps a single global **revision**.
//! - Each key remembers the revision it was created at (`create_revision`)
//!   and last modified at (`mod_revision`). A missing key has revision 0.
//! - A **transaction** evaluates a list of compares and atomically applies
//!   either the success or the failure ops.
//! - Keys can be bound to a **lease**; when the lease expires or is revoked,
//!   its keys are deleted.
//! - **Watches** stream every committed change under a prefix.
//!
//! ## Compare-and-Swap
//!
//! ```text
//!   read  key=a  mod_revision=7
//!   ...
//!   txn   if mod_revision(a) == 7  then put(a, new)
//!         └── fails if anyone wrote `a` in between
//! ```

use crate::error::{MetadataError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub type Revision = i64;
pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    /// Number of modifications since creation, starting at 1.
    pub version: i64,
    pub lease: Option<LeaseId>,
}

impl KeyValue {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(|source| MetadataError::Decode {
            key: self.key.clone(),
            source,
        })
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    Less,
    Greater,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// Compares the key's mod revision, 0 if the key does not exist.
    ModRevision {
        key: String,
        op: CompareOp,
        revision: Revision,
    },
    /// No key under the prefix changed after `revision` and no key was
    /// added or removed (the prefix still holds `count` keys).
    PrefixUnchanged {
        prefix: String,
        revision: Revision,
        count: usize,
    },
}

impl Compare {
    pub fn key_missing(key: impl Into<String>) -> Self {
        Compare::ModRevision {
            key: key.into(),
            op: CompareOp::Equal,
            revision: 0,
        }
    }

    pub fn mod_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Compare::ModRevision {
            key: key.into(),
            op,
            revision,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put {
        key: String,
        value: Bytes,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
    DeletePrefix {
        prefix: String,
    },
}

impl Op {
    pub fn put(key: impl Into<String>, value: Bytes) -> Self {
        Op::Put {
            key: key.into(),
            value,
            lease: None,
        }
    }

    pub fn put_json<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Op::put(key, encode(value)?))
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete { key: key.into() }
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        Op::DeletePrefix {
            prefix: prefix.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: Revision,
}

#[derive(Debug, Clone, Default)]
pub struct GetPrefixResponse {
    /// Key-values sorted by key.
    pub kvs: Vec<KeyValue>,
    /// Store revision the snapshot was taken at.
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// For deletes only `key` and `mod_revision` (the delete revision) are set.
    pub kv: KeyValue,
    pub prev: Option<KeyValue>,
}

/// All events committed by one transaction.
#[derive(Debug, Clone)]
pub struct WatchResponse {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Stream of changes under a prefix.
pub struct WatchStream {
    prefix: String,
    rx: broadcast::Receiver<WatchResponse>,
}

impl WatchStream {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<WatchResponse>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next batch of events under the prefix.
    ///
    /// Returns `None` once the store is gone. A lagged watcher gets
    /// `WatchLagged` once and continues with newer events.
    pub async fn next(&mut self) -> Option<Result<WatchResponse>> {
        loop {
            match self.rx.recv().await {
                Ok(mut resp) => {
                    resp.events.retain(|e| e.kv.key.starts_with(&self.prefix));
                    if !resp.events.is_empty() {
                        return Some(Ok(resp));
                    }
                }
                Err(RecvError::Lagged(n)) => return Some(Err(MetadataError::WatchLagged(n))),
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Key-value store backend.
///
/// All implementations must be Send + Sync, the store is shared across tasks
/// as `Arc<dyn KvStore>`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> Result<GetPrefixResponse>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// Grants a lease that expires unless kept alive within `ttl`.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revokes the lease and deletes all keys bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Watches changes committed after the call.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;

    async fn put(&self, key: &str, value: Bytes) -> Result<Revision> {
        let resp = self.txn(Txn::new().and_then([Op::put(key, value)])).await?;
        Ok(resp.revision)
    }

    async fn put_with_lease(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<Revision> {
        let op = Op::Put {
            key: key.to_string(),
            value,
            lease: Some(lease),
        };
        let resp = self.txn(Txn::new().and_then([op])).await?;
        Ok(resp.revision)
    }

    async fn delete(&self, key: &str) -> Result<Revision> {
        let resp = self.txn(Txn::new().and_then([Op::delete(key)])).await?;
        Ok(resp.revision)
    }
}
