//! Distribution Node - Work Sharing Between Worker Nodes
//!
//! Every worker node registers itself in its group under a lease and watches
//! the registrations of the others. Keys (sinks) are mapped to nodes by a
//! consistent hash ring, so each node handles its own share of the sinks and
//! adding or removing a node moves only a fraction of them.
//!
//! ## How It Works
//!
//! 1. **Watch**: Subscribe to the group prefix, then take a snapshot
//! 2. **Register**: Put `runtime/distribution/group/<group>/nodes/<id>` under a lease
//! 3. **Keep alive**: Renew the lease every `keep_alive`, re-register if it expired
//! 4. **Follow**: Rebuild the ring on every membership change and notify subscribers
//! 5. **Stop**: Delete the registration and revoke the lease
//!
//! ## Ring
//!
//! ```text
//!            node-a#17   node-c#3
//!         ┌─────●───────────●──────┐
//!         │                        │   key ──sha256──► first point
//!  node-b#8●                       ● node-a#42         clockwise
//!         │                        │
//!         └──────●──────────●──────┘
//!            node-c#90   node-b#61
//! ```
//!
//! Each node is hashed to `VIRTUAL_NODES` points (SHA-256 of `<id>#<n>`).
//! A lookup is a binary search for the first point at or after the key hash.
//!
//! ## Consistency
//!
//! Membership is eventually consistent. Two nodes may both consider
//! themselves owners of a key for a moment; every mutation of the storage
//! layer is an atomic compare-and-swap operation, so that only costs
//! duplicated work.

use crate::config::DistributionConfig;
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sinkhouse_metadata::{
    encode, Compare, EventKind, KvStore, LeaseId, MetadataError, Op, Txn, WatchStream,
};
use sinkhouse_observability::metrics;
use sinkhouse_storage::schema::distribution as keys;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Points of one node on the ring.
pub const VIRTUAL_NODES: usize = 100;

const RESYNC_BACKOFF: Duration = Duration::from_millis(500);

/// Consistent hash ring over node ids.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    points: Vec<(u64, usize)>,
    nodes: Vec<String>,
}

impl Ring {
    pub fn new(nodes: impl IntoIterator<Item = String>) -> Self {
        let nodes: Vec<String> = nodes
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut points = Vec::with_capacity(nodes.len() * VIRTUAL_NODES);
        for (i, node) in nodes.iter().enumerate() {
            for n in 0..VIRTUAL_NODES {
                points.push((hash(&format!("{node}#{n}")), i));
            }
        }
        points.sort_unstable();
        Self { points, nodes }
    }

    /// Node ids, sorted.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.binary_search_by(|n| n.as_str().cmp(node_id)).is_ok()
    }

    pub fn node_for(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash(key);
        let idx = self.points.partition_point(|(p, _)| *p < h) % self.points.len();
        Some(self.nodes[self.points[idx].1].as_str())
    }
}

fn hash(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

/// Value of a node registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
}

struct State {
    ring: RwLock<Ring>,
    changes: watch::Sender<u64>,
    lease: AtomicI64,
}

impl State {
    fn ring(&self) -> std::sync::RwLockReadGuard<'_, Ring> {
        self.ring.read().unwrap_or_else(|e| e.into_inner())
    }

    fn replace(&self, members: &BTreeSet<String>) {
        let ring = Ring::new(members.iter().cloned());
        metrics::DISTRIBUTION_NODES.set(members.len() as i64);
        *self.ring.write().unwrap_or_else(|e| e.into_inner()) = ring;
        self.changes.send_modify(|v| *v += 1);
    }
}

/// This node's membership in a distribution group.
pub struct DistributionNode {
    node_id: String,
    group: String,
    store: Arc<dyn KvStore>,
    state: Arc<State>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributionNode {
    /// Registers the node and waits until it sees itself in the group.
    pub async fn start(
        store: Arc<dyn KvStore>,
        node_id: impl Into<String>,
        config: DistributionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = node_id.into();
        let prefix = keys::nodes_prefix(&config.group);
        let key = keys::node(&config.group, &node_id);

        // Subscribe first, so no change after the snapshot is missed.
        let stream = store.watch_prefix(&prefix).await?;
        let (members, revision) = snapshot(store.as_ref(), &prefix).await?;

        let (changes, _) = watch::channel(0);
        let state = Arc::new(State {
            ring: RwLock::new(Ring::new(members.iter().cloned())),
            changes,
            lease: AtomicI64::new(0),
        });

        let info = NodeInfo {
            node_id: node_id.clone(),
        };
        let lease = register(store.as_ref(), &key, &info, config.ttl).await?;
        state.lease.store(lease, Ordering::SeqCst);
        info!(
            node_id = %node_id,
            group = %config.group,
            lease,
            ttl_secs = config.ttl.as_secs(),
            "distribution node registered"
        );

        let cancel = CancellationToken::new();
        let watch_task = WatchTask {
            store: store.clone(),
            prefix,
            state: state.clone(),
            members,
            revision,
        };
        let keep_alive_task = KeepAliveTask {
            store: store.clone(),
            key,
            info,
            state: state.clone(),
            ttl: config.ttl,
            interval: config.keep_alive,
        };
        let tasks = vec![
            tokio::spawn(watch_task.run(stream, cancel.clone())),
            tokio::spawn(keep_alive_task.run(cancel.clone())),
        ];

        let node = Self {
            node_id,
            group: config.group,
            store,
            state,
            cancel,
            tasks: Mutex::new(tasks),
        };

        if let Err(e) = node.wait_for_self(config.startup_timeout).await {
            node.stop().await;
            return Err(e);
        }
        Ok(node)
    }

    async fn wait_for_self(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.changes.subscribe();
        let found = tokio::time::timeout(timeout, async {
            loop {
                if self.state.ring().contains(&self.node_id) {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match found {
            Ok(true) => Ok(()),
            _ => Err(AgentError::StartupTimeout {
                node_id: self.node_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Ids of all nodes in the group, sorted.
    pub fn nodes(&self) -> Vec<String> {
        self.state.ring().nodes().to_vec()
    }

    pub fn node_for(&self, key: &str) -> Option<String> {
        self.state.ring().node_for(key).map(str::to_string)
    }

    pub fn is_owner(&self, key: &str) -> bool {
        self.state.ring().node_for(key) == Some(self.node_id.as_str())
    }

    /// Receiver notified on every membership change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.state.changes.subscribe()
    }

    /// Stops the background tasks and removes the registration.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(node_id = %self.node_id, error = %e, "distribution task failed");
            }
        }

        let key = keys::node(&self.group, &self.node_id);
        if let Err(e) = self.store.delete(&key).await {
            warn!(node_id = %self.node_id, error = %e, "cannot delete node registration");
        }
        let lease = self.state.lease.load(Ordering::SeqCst);
        match self.store.revoke_lease(lease).await {
            Ok(()) | Err(MetadataError::LeaseNotFound(_)) => {}
            Err(e) => warn!(node_id = %self.node_id, lease, error = %e, "cannot revoke lease"),
        }
        info!(node_id = %self.node_id, group = %self.group, "distribution node stopped");
    }
}

impl Drop for DistributionNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn snapshot(store: &dyn KvStore, prefix: &str) -> Result<(BTreeSet<String>, i64)> {
    let resp = store.get_prefix(prefix).await?;
    let members = resp
        .kvs
        .iter()
        .filter_map(|kv| kv.key.strip_prefix(prefix).map(str::to_string))
        .collect();
    Ok((members, resp.revision))
}

async fn register(
    store: &dyn KvStore,
    key: &str,
    info: &NodeInfo,
    ttl: Duration,
) -> Result<LeaseId> {
    let lease = store.grant_lease(ttl).await?;
    let txn = Txn::new()
        .when([Compare::key_missing(key)])
        .and_then([Op::Put {
            key: key.to_string(),
            value: encode(info)?,
            lease: Some(lease),
        }]);
    let resp = store.txn(txn).await?;
    if !resp.succeeded {
        if let Err(e) = store.revoke_lease(lease).await {
            warn!(lease, error = %e, "cannot revoke unused lease");
        }
        return Err(AgentError::NodeAlreadyRegistered(info.node_id.clone()));
    }
    Ok(lease)
}

/// Follows registrations in the group.
struct WatchTask {
    store: Arc<dyn KvStore>,
    prefix: String,
    state: Arc<State>,
    members: BTreeSet<String>,
    revision: i64,
}

impl WatchTask {
    async fn run(mut self, mut stream: WatchStream, cancel: CancellationToken) {
        debug!(prefix = %self.prefix, "distribution watch started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(resp)) => {
                    if resp.revision <= self.revision {
                        continue;
                    }
                    self.revision = resp.revision;
                    let mut changed = false;
                    for event in resp.events {
                        let Some(node_id) = event.kv.key.strip_prefix(&self.prefix) else {
                            continue;
                        };
                        changed |= match event.kind {
                            EventKind::Put => self.members.insert(node_id.to_string()),
                            EventKind::Delete => self.members.remove(node_id),
                        };
                    }
                    if changed {
                        self.apply();
                    }
                }
                Some(Err(e)) => {
                    warn!(prefix = %self.prefix, error = %e, "distribution watch lagged, resyncing");
                    self.resync(&cancel).await;
                }
                None => break,
            }
        }
        debug!(prefix = %self.prefix, "distribution watch stopped");
    }

    async fn resync(&mut self, cancel: &CancellationToken) {
        loop {
            match snapshot(self.store.as_ref(), &self.prefix).await {
                Ok((members, revision)) => {
                    self.revision = revision;
                    if members != self.members {
                        self.members = members;
                        self.apply();
                    }
                    return;
                }
                Err(e) => error!(prefix = %self.prefix, error = %e, "cannot load distribution nodes"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RESYNC_BACKOFF) => {}
            }
        }
    }

    fn apply(&self) {
        info!(nodes = ?self.members, "distribution changed");
        self.state.replace(&self.members);
    }
}

/// Keeps the node registration alive.
struct KeepAliveTask {
    store: Arc<dyn KvStore>,
    key: String,
    info: NodeInfo,
    state: Arc<State>,
    ttl: Duration,
    interval: Duration,
}

impl KeepAliveTask {
    async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let lease = self.state.lease.load(Ordering::SeqCst);
            match self.store.keep_alive(lease).await {
                Ok(()) => debug!(node_id = %self.info.node_id, lease, "node lease kept alive"),
                Err(MetadataError::LeaseNotFound(_)) => {
                    warn!(node_id = %self.info.node_id, lease, "node lease expired, registering again");
                    match register(self.store.as_ref(), &self.key, &self.info, self.ttl).await {
                        Ok(lease) => self.state.lease.store(lease, Ordering::SeqCst),
                        Err(e) => error!(node_id = %self.info.node_id, error = %e, "cannot register node"),
                    }
                }
                Err(e) => error!(node_id = %self.info.node_id, lease, error = %e, "node keep-alive failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sinkhouse_metadata::MemoryKvStore;
    use std::collections::HashMap;

    fn config() -> DistributionConfig {
        DistributionConfig {
            group: "test".into(),
            ttl: Duration::from_secs(15),
            keep_alive: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_ring_lookup_is_stable() {
        let ring = Ring::new(["node-1".to_string(), "node-2".to_string(), "node-3".to_string()]);
        assert_eq!(ring.nodes(), ["node-1", "node-2", "node-3"]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..3000 {
            let key = format!("123/456/my-source/sink-{i}");
            let node = ring.node_for(&key).unwrap().to_string();
            assert_eq!(ring.node_for(&key), Some(node.as_str()));
            *counts.entry(node).or_default() += 1;
        }
        // Virtual nodes spread the keys.
        for node in ring.nodes() {
            assert!(counts[node] > 500, "{node}: {}", counts[node]);
        }
    }

    #[test]
    fn test_ring_removal_moves_only_removed_keys() {
        let all = Ring::new(["node-1".to_string(), "node-2".to_string(), "node-3".to_string()]);
        let two = Ring::new(["node-1".to_string(), "node-3".to_string()]);
        for i in 0..1000 {
            let key = format!("sink-{i}");
            let before = all.node_for(&key).unwrap();
            let after = two.node_for(&key).unwrap();
            if before != "node-2" {
                assert_eq!(before, after);
            }
        }
        assert_eq!(Ring::default().node_for("key"), None);
    }

    #[tokio::test]
    async fn test_nodes_see_each_other() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let node1 = DistributionNode::start(store.clone(), "node-1", config())
            .await
            .unwrap();
        assert_eq!(node1.nodes(), vec!["node-1"]);
        assert!(node1.is_owner("any-key"));

        let mut changes = node1.subscribe();
        let node2 = DistributionNode::start(store.clone(), "node-2", config())
            .await
            .unwrap();
        changes.changed().await.unwrap();
        assert_eq!(node1.nodes(), vec!["node-1", "node-2"]);
        assert_eq!(node2.nodes(), vec!["node-1", "node-2"]);

        // Exactly one owner per key.
        for i in 0..100 {
            let key = format!("sink-{i}");
            assert_ne!(node1.is_owner(&key), node2.is_owner(&key));
            assert_eq!(node1.node_for(&key), node2.node_for(&key));
        }

        node2.stop().await;
        changes.changed().await.unwrap();
        assert_eq!(node1.nodes(), vec!["node-1"]);
        node1.stop().await;

        let resp = store.get_prefix(&keys::nodes_prefix("test")).await.unwrap();
        assert!(resp.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_node_id() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let node = DistributionNode::start(store.clone(), "node-1", config())
            .await
            .unwrap();
        let err = DistributionNode::start(store.clone(), "node-1", config())
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "distribution node \"node-1\" is already registered in the group"
        );
        node.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_registers_again() {
        let store = Arc::new(MemoryKvStore::new());
        let node = DistributionNode::start(store.clone(), "node-1", config())
            .await
            .unwrap();
        let lease = node.state.lease.load(Ordering::SeqCst);

        // Drop the lease behind the node's back.
        store.revoke_lease(lease).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let resp = store.get_prefix(&keys::nodes_prefix("test")).await.unwrap();
        assert_eq!(resp.kvs.len(), 1);
        assert_ne!(node.state.lease.load(Ordering::SeqCst), lease);
        node.stop().await;
    }
}
