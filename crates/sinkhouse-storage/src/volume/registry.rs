//! Writable volume registry
//!
//! A writer node registers its volumes under a lease. While the node is
//! alive the lease is kept alive in the background; if the node dies the
//! lease expires and its volumes disappear from the registry, so no new file
//! is assigned to them.

use crate::error::Result;
use crate::schema::volume as keys;
use serde::{Deserialize, Serialize};
use sinkhouse_core::VolumeId;
use sinkhouse_metadata::{encode, KvStore, LeaseId, MetadataError, Op, Txn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: VolumeId,
    pub node_id: String,
    pub node_address: String,
    #[serde(rename = "type")]
    pub volume_type: String,
    pub label: String,
    pub path: String,
}

#[derive(Clone)]
pub struct VolumeRegistry {
    store: Arc<dyn KvStore>,
}

impl VolumeRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Registers volumes and keeps them registered until the returned
    /// registration is stopped.
    pub async fn register(
        &self,
        volumes: Vec<VolumeInfo>,
        ttl: Duration,
    ) -> Result<VolumeRegistration> {
        let lease = put_volumes(self.store.as_ref(), &volumes, ttl).await?;
        info!(
            count = volumes.len(),
            lease,
            ttl_secs = ttl.as_secs(),
            "volumes registered"
        );

        let cancel = CancellationToken::new();
        let task = KeepAliveTask {
            store: self.store.clone(),
            volumes,
            ttl,
            lease,
        };
        let handle = tokio::spawn(task.run(cancel.clone()));
        Ok(VolumeRegistration { cancel, handle })
    }

    /// All registered volumes, sorted by id.
    pub async fn list_writable(&self) -> Result<Vec<VolumeInfo>> {
        let resp = self.store.get_prefix(keys::writers_prefix()).await?;
        let mut volumes = resp
            .kvs
            .iter()
            .map(|kv| kv.decode::<VolumeInfo>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        Ok(volumes)
    }
}

async fn put_volumes(
    store: &dyn KvStore,
    volumes: &[VolumeInfo],
    ttl: Duration,
) -> std::result::Result<LeaseId, MetadataError> {
    let lease = store.grant_lease(ttl).await?;
    let mut ops = Vec::with_capacity(volumes.len());
    for volume in volumes {
        ops.push(Op::Put {
            key: keys::writer(&volume.volume_id),
            value: encode(volume)?,
            lease: Some(lease),
        });
    }
    store.txn(Txn::new().and_then(ops)).await?;
    Ok(lease)
}

/// Handle of registered volumes.
pub struct VolumeRegistration {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl VolumeRegistration {
    /// Stops the keep-alive and removes the volumes from the registry.
    pub async fn unregister(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "volume keep-alive task failed");
        }
    }
}

struct KeepAliveTask {
    store: Arc<dyn KvStore>,
    volumes: Vec<VolumeInfo>,
    ttl: Duration,
    lease: LeaseId,
}

impl KeepAliveTask {
    async fn run(mut self, cancel: CancellationToken) {
        let interval = self.ttl / 3;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.store.keep_alive(self.lease).await {
                Ok(()) => debug!(lease = self.lease, "volumes lease kept alive"),
                Err(MetadataError::LeaseNotFound(_)) => {
                    warn!(lease = self.lease, "volumes lease expired, registering again");
                    match put_volumes(self.store.as_ref(), &self.volumes, self.ttl).await {
                        Ok(lease) => self.lease = lease,
                        Err(e) => error!(error = %e, "cannot register volumes"),
                    }
                }
                Err(e) => error!(lease = self.lease, error = %e, "volumes keep-alive failed"),
            }
        }

        match self.store.revoke_lease(self.lease).await {
            Ok(()) | Err(MetadataError::LeaseNotFound(_)) => {
                info!(count = self.volumes.len(), "volumes unregistered")
            }
            Err(e) => warn!(error = %e, "cannot revoke volumes lease"),
        }
    }
}
