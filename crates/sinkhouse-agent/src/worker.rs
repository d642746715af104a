//! Worker Node
//!
//! A worker node ties the pieces together:
//!
//! ```text
//!   ┌──────────────────────────── Worker ────────────────────────────┐
//!   │                                                                │
//!   │  VolumeRegistration ── volumes under a lease                   │
//!   │  QuotaChecker       ── buffered bytes per source               │
//!   │  WriterPool         ── open slice writers, statistics sync     │
//!   │  DistributionNode   ── node key under a lease, ownership ring  │
//!   │  Checker            ── rotation, upload and import             │
//!   │  Cleanup            ── metadata of expired files               │
//!   │                                                                │
//!   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Components start in the order above and stop in the reverse order
//! through the [`ShutdownCoordinator`].
//!
//! Closed slices and files go to a [`DirectoryStaging`] unless the builder
//! is given another uploader and importer.
//!
//! ## Example
//!
//! ```ignore
//! let worker = WorkerBuilder::new()
//!     .node_id("worker-1")
//!     .store(store)
//!     .resources(provider)
//!     .volume(volume)
//!     .start()
//!     .await?;
//!
//! tokio::signal::ctrl_c().await?;
//! worker.shutdown().await;
//! ```

use crate::checker::{Checker, CheckerServices};
use crate::cleanup::Cleanup;
use crate::config::WorkerConfig;
use crate::distribution::DistributionNode;
use crate::error::{AgentError, Result};
use crate::shutdown::ShutdownCoordinator;
use crate::staging::{DirectoryStaging, DirectoryStagingConfig};
use sinkhouse_core::VolumeId;
use sinkhouse_metadata::KvStore;
use sinkhouse_storage::local::SetLenAllocator;
use sinkhouse_storage::{
    FileImporter, FileResourceProvider, QuotaChecker, Repository, SliceUploader, VolumeInfo,
    WriterPool,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Worker {
    node_id: String,
    repo: Repository,
    distribution: Arc<DistributionNode>,
    writers: Arc<WriterPool>,
    checker: Arc<Checker>,
    cleanup: Arc<Cleanup>,
    shutdown: ShutdownCoordinator,
}

impl Worker {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn distribution(&self) -> &Arc<DistributionNode> {
        &self.distribution
    }

    /// Writers of the slices opened on the volumes of this node.
    pub fn writers(&self) -> &Arc<WriterPool> {
        &self.writers
    }

    pub fn checker(&self) -> &Arc<Checker> {
        &self.checker
    }

    pub fn cleanup(&self) -> &Arc<Cleanup> {
        &self.cleanup
    }

    /// Token cancelled once shutdown starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Stops the background tasks, closes the writers, leaves the group and
    /// unregisters the volumes.
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, "worker shutting down");
        self.shutdown.shutdown().await;
    }
}

pub struct WorkerBuilder {
    node_id: Option<String>,
    store: Option<Arc<dyn KvStore>>,
    resources: Option<Arc<dyn FileResourceProvider>>,
    config: WorkerConfig,
    volumes: Vec<VolumeInfo>,
    staging: DirectoryStagingConfig,
    uploader: Option<Arc<dyn SliceUploader>>,
    importer: Option<Arc<dyn FileImporter>>,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            node_id: None,
            store: None,
            resources: None,
            config: WorkerConfig::default(),
            volumes: Vec::new(),
            staging: DirectoryStagingConfig::default(),
            uploader: None,
            importer: None,
        }
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the provider of staging resources of new files
    pub fn resources(mut self, resources: Arc<dyn FileResourceProvider>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a local volume registered as writable
    pub fn volume(mut self, volume: VolumeInfo) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Directories of the default uploader and importer
    pub fn staging(mut self, staging: DirectoryStagingConfig) -> Self {
        self.staging = staging;
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn SliceUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn importer(mut self, importer: Arc<dyn FileImporter>) -> Self {
        self.importer = Some(importer);
        self
    }

    pub async fn start(self) -> Result<Worker> {
        let node_id = self
            .node_id
            .filter(|id| !id.is_empty())
            .ok_or(AgentError::MissingField("node_id"))?;
        let store = self.store.ok_or(AgentError::MissingField("store"))?;
        let resources = self.resources.ok_or(AgentError::MissingField("resources"))?;
        self.config.validate()?;

        let repo = Repository::new(store.clone(), resources, self.config.storage.repository.clone());
        let shutdown = ShutdownCoordinator::new();
        let volume_paths: HashMap<VolumeId, PathBuf> = self
            .volumes
            .iter()
            .map(|v| (v.volume_id.clone(), PathBuf::from(&v.path)))
            .collect();

        // Volumes
        if !self.volumes.is_empty() {
            let registration = repo
                .volumes
                .register(self.volumes, self.config.storage.volume_registration_ttl)
                .await?;
            shutdown.on_shutdown("volumes", move || registration.unregister());
        }

        // Quota
        let quota = QuotaChecker::new(
            self.config.storage.quota.clone(),
            Arc::new(repo.statistics.clone()),
        );
        let quota_task = quota.start(shutdown.token());
        shutdown.on_shutdown("quota", move || async move {
            if let Err(e) = quota_task.await {
                error!(error = %e, "quota task failed");
            }
        });

        // Writers
        let writers = Arc::new(WriterPool::new(
            volume_paths.clone(),
            Arc::new(SetLenAllocator),
            repo.statistics.clone(),
            quota,
        ));
        let sync_task =
            writers.start_background_sync(self.config.storage.stats_sync_interval, shutdown.token());
        let w = writers.clone();
        shutdown.on_shutdown("writers", move || async move {
            if let Err(e) = sync_task.await {
                error!(error = %e, "statistics sync task failed");
            }
            w.shutdown().await;
        });

        // Distribution
        let distribution = match DistributionNode::start(
            store.clone(),
            node_id.clone(),
            self.config.distribution.clone(),
        )
        .await
        {
            Ok(node) => Arc::new(node),
            Err(e) => {
                shutdown.shutdown().await;
                return Err(e);
            }
        };
        let d = distribution.clone();
        shutdown.on_shutdown("distribution", move || async move { d.stop().await });

        // Checker
        let staging = Arc::new(DirectoryStaging::new(self.staging, volume_paths));
        let default_uploader: Arc<dyn SliceUploader> = staging.clone();
        let default_importer: Arc<dyn FileImporter> = staging;
        let services = CheckerServices {
            uploader: self.uploader.unwrap_or(default_uploader),
            importer: self.importer.unwrap_or(default_importer),
            writers: Some(writers.clone()),
        };
        let checker = match Checker::start(
            store.clone(),
            repo.clone(),
            distribution.clone(),
            services,
            self.config.checker,
        )
        .await
        {
            Ok(checker) => Arc::new(checker),
            Err(e) => {
                shutdown.shutdown().await;
                return Err(e);
            }
        };
        let c = checker.clone();
        shutdown.on_shutdown("checker", move || async move { c.stop().await });

        // Cleanup
        let cleanup = match Cleanup::start(
            store,
            repo.clone(),
            distribution.clone(),
            self.config.cleanup,
        )
        .await
        {
            Ok(cleanup) => Arc::new(cleanup),
            Err(e) => {
                shutdown.shutdown().await;
                return Err(e);
            }
        };
        let c = cleanup.clone();
        shutdown.on_shutdown("cleanup", move || async move { c.stop().await });

        info!(
            node_id = %node_id,
            group = %self.config.distribution.group,
            "worker started"
        );
        Ok(Worker {
            node_id,
            repo,
            distribution,
            writers,
            checker,
            cleanup,
            shutdown,
        })
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
