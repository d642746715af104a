//! In-process KvStore
//!
//! `MemoryKvStore` implements the full `KvStore` contract inside one process.
//! It backs the test suites and single-process deployments, where all workers
//! share one `Arc<MemoryKvStore>`.
//!
//! ## Implementation Details
//!
//! - Keys live in a `BTreeMap`, so prefix scans are range scans in key order.
//! - One mutex guards the whole state; every transaction is linearizable.
//! - Lease deadlines use `tokio::time::Instant`, so tests can pause and
//!   advance the clock. Expired leases are collected at the start of every
//!   operation.
//! - Watchers subscribe to a broadcast channel carrying one response per
//!   committed transaction.

use crate::error::{MetadataError, Result};
use crate::kv::{
    Compare, CompareOp, EventKind, GetPrefixResponse, KeyValue, KvStore, LeaseId, Op, Revision,
    Txn, TxnResponse, WatchEvent, WatchResponse, WatchStream,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::debug;

const WATCH_CHANNEL_CAPACITY: usize = 4096;

#[derive(Clone)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    revision: Revision,
    data: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease_id: LeaseId,
}

pub struct MemoryKvStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchResponse>,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State {
                revision: 1,
                next_lease_id: 1,
                ..Default::default()
            }),
            events,
        }
    }

    /// Current store revision.
    pub async fn revision(&self) -> Revision {
        self.state.lock().await.revision
    }

    /// All keys, for test assertions.
    pub async fn keys(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        self.expire_leases(&mut state);
        state.data.keys().cloned().collect()
    }

    fn expire_leases(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease = id, "lease expired");
            self.remove_lease(state, id);
        }
    }

    fn remove_lease(&self, state: &mut State, id: LeaseId) -> bool {
        let Some(lease) = state.leases.remove(&id) else {
            return false;
        };
        if lease.keys.is_empty() {
            return true;
        }
        state.revision += 1;
        let revision = state.revision;
        let mut events = Vec::with_capacity(lease.keys.len());
        for key in lease.keys {
            if let Some(prev) = state.data.remove(&key) {
                events.push(delete_event(prev, revision));
            }
        }
        self.notify(revision, events);
        true
    }

    fn notify(&self, revision: Revision, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        // No receivers is fine.
        let _ = self.events.send(WatchResponse { revision, events });
    }

    fn compare(state: &State, compare: &Compare) -> bool {
        match compare {
            Compare::ModRevision { key, op, revision } => {
                let actual = state.data.get(key).map_or(0, |kv| kv.mod_revision);
                match op {
                    CompareOp::Equal => actual == *revision,
                    CompareOp::Less => actual < *revision,
                    CompareOp::Greater => actual > *revision,
                }
            }
            Compare::PrefixUnchanged {
                prefix,
                revision,
                count,
            } => {
                let mut n = 0;
                for kv in prefix_range(&state.data, prefix) {
                    if kv.mod_revision > *revision {
                        return false;
                    }
                    n += 1;
                }
                n == *count
            }
        }
    }

    fn apply(state: &mut State, ops: Vec<Op>, revision: Revision) -> Result<Vec<WatchEvent>> {
        let mut events = Vec::new();
        for op in ops {
            match op {
                Op::Put { key, value, lease } => {
                    if let Some(id) = lease {
                        if !state.leases.contains_key(&id) {
                            return Err(MetadataError::LeaseNotFound(id));
                        }
                    }
                    let prev = state.data.get(&key).cloned();
                    if let Some(old_lease) = prev.as_ref().and_then(|p| p.lease) {
                        if Some(old_lease) != lease {
                            if let Some(l) = state.leases.get_mut(&old_lease) {
                                l.keys.remove(&key);
                            }
                        }
                    }
                    if let Some(id) = lease {
                        if let Some(l) = state.leases.get_mut(&id) {
                            l.keys.insert(key.clone());
                        }
                    }
                    let kv = KeyValue {
                        key: key.clone(),
                        value,
                        create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
                        mod_revision: revision,
                        version: prev.as_ref().map_or(1, |p| p.version + 1),
                        lease,
                    };
                    state.data.insert(key, kv.clone());
                    events.push(WatchEvent {
                        kind: EventKind::Put,
                        kv,
                        prev,
                    });
                }
                Op::Delete { key } => {
                    if let Some(prev) = state.data.remove(&key) {
                        Self::unbind(state, &prev);
                        events.push(delete_event(prev, revision));
                    }
                }
                Op::DeletePrefix { prefix } => {
                    let keys: Vec<String> = prefix_range(&state.data, &prefix)
                        .map(|kv| kv.key.clone())
                        .collect();
                    for key in keys {
                        if let Some(prev) = state.data.remove(&key) {
                            Self::unbind(state, &prev);
                            events.push(delete_event(prev, revision));
                        }
                    }
                }
            }
        }
        Ok(events)
    }

    fn unbind(state: &mut State, kv: &KeyValue) {
        if let Some(id) = kv.lease {
            if let Some(l) = state.leases.get_mut(&id) {
                l.keys.remove(&kv.key);
            }
        }
    }
}

fn delete_event(prev: KeyValue, revision: Revision) -> WatchEvent {
    WatchEvent {
        kind: EventKind::Delete,
        kv: KeyValue {
            key: prev.key.clone(),
            value: Bytes::new(),
            create_revision: 0,
            mod_revision: revision,
            version: 0,
            lease: None,
        },
        prev: Some(prev),
    }
}

fn prefix_range<'a>(
    data: &'a BTreeMap<String, KeyValue>,
    prefix: &'a str,
) -> impl Iterator<Item = &'a KeyValue> + 'a {
    data.range(prefix.to_string()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
        .map(|(_, v)| v)
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut state = self.state.lock().await;
        self.expire_leases(&mut state);
        Ok(state.data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetPrefixResponse> {
        let mut state = self.state.lock().await;
        self.expire_leases(&mut state);
        Ok(GetPrefixResponse {
            kvs: prefix_range(&state.data, prefix).cloned().collect(),
            revision: state.revision,
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let mut state = self.state.lock().await;
        self.expire_leases(&mut state);

        let succeeded = txn.compares.iter().all(|c| Self::compare(&state, c));
        let ops = if succeeded { txn.success } else { txn.failure };
        if ops.is_empty() {
            return Ok(TxnResponse {
                succeeded,
                revision: state.revision,
            });
        }

        // Apply on a copy, so a failing op leaves data and leases untouched.
        let mut next = State {
            revision: state.revision + 1,
            data: state.data.clone(),
            leases: state.leases.clone(),
            next_lease_id: state.next_lease_id,
        };
        let revision = next.revision;
        match Self::apply(&mut next, ops, revision) {
            Ok(events) => {
                if events.is_empty() {
                    // Deletes of missing keys do not create a revision.
                    return Ok(TxnResponse {
                        succeeded,
                        revision: state.revision,
                    });
                }
                *state = next;
                self.notify(revision, events);
                Ok(TxnResponse {
                    succeeded,
                    revision,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.state.lock().await;
        self.expire_leases(&mut state);
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        self.expire_leases(&mut state);
        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(MetadataError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        self.expire_leases(&mut state);
        if self.remove_lease(&mut state, lease) {
            Ok(())
        } else {
            Err(MetadataError::LeaseNotFound(lease))
        }
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        Ok(WatchStream::new(prefix, self.events.subscribe()))
    }
}
