//! Sinkhouse Agent - Storage Worker Nodes
//!
//! Worker nodes share the sinks of a project through a consistent hash ring
//! built from the nodes registered in the metadata store. Each node checks
//! the opened slices and files of the sinks it owns and rotates them once
//! their upload or import conditions are met, then uploads the closed
//! slices and imports the closed files.
//!
//! ## Architecture
//!
//! Nodes are **stateless**. Everything they decide is written to the metadata
//! store with atomic transactions, so two nodes briefly owning the same sink
//! after a membership change cannot corrupt the state; the loser of a race
//! gets a conflict and retries on the next check.
//!
//! ## Components
//!
//! - **DistributionNode**: Group membership under a lease and sink ownership
//! - **Checker**: Periodic condition checks, uploads and imports over
//!   mirrored state
//! - **conditions**: Count, size and time thresholds with reasons
//! - **Cleanup**: Deletes the metadata of expired files
//! - **DirectoryStaging**: Uploads and imports into local directories
//! - **ShutdownCoordinator**: Ordered graceful shutdown
//! - **Worker**: All of the above wired together
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use sinkhouse_agent::{StaticResourceConfig, StaticResourceProvider, WorkerBuilder};
//! use sinkhouse_metadata::MemoryKvStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = WorkerBuilder::new()
//!     .node_id("worker-001")
//!     .store(Arc::new(MemoryKvStore::new()))
//!     .resources(Arc::new(StaticResourceProvider::new(StaticResourceConfig::default())))
//!     .start()
//!     .await?;
//!
//! // ... serve traffic ...
//!
//! worker.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod checker;
pub mod cleanup;
pub mod conditions;
pub mod config;
pub mod distribution;
pub mod error;
pub mod resources;
pub mod shutdown;
pub mod staging;
pub mod worker;

pub use checker::{Action, CheckReport, Checker, CheckerServices};
pub use cleanup::{Cleanup, CleanupReport};
pub use conditions::{evaluate, guard_min_interval, Evaluation};
pub use config::{CheckerConfig, CleanupConfig, DistributionConfig, WorkerConfig};
pub use distribution::{DistributionNode, Ring};
pub use error::{AgentError, Result};
pub use resources::{StaticResourceConfig, StaticResourceProvider};
pub use shutdown::ShutdownCoordinator;
pub use staging::{DirectoryStaging, DirectoryStagingConfig};
pub use worker::{Worker, WorkerBuilder};
