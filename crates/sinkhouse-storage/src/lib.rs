//! sinkhouse Storage Layer
//!
//! This crate keeps the state of every file and slice of a sink in the
//! metadata store and writes slices to local volumes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   rotate / close / state_transition
//! │   Callers    │──────────────────────────────┐
//! └──────────────┘                              ▼
//!                                      ┌─────────────────┐
//!                                      │   Repository    │
//!                                      │ files  slices   │
//!                                      └───┬─────────┬───┘
//!                                          │  Hook   │
//!               ┌──────────────────────────┼─────────┼─────────────────┐
//!               ▼                          ▼         ▼                 ▼
//!      ┌────────────────┐   ┌────────────────┐ ┌────────────┐ ┌────────────────┐
//!      │  Definitions   │   │   Statistics   │ │  Volumes   │ │ File resources │
//!      │ sinks, tokens  │   │ per level      │ │ assignment │ │ (staging API)  │
//!      └────────────────┘   └────────────────┘ └────────────┘ └────────────────┘
//!               │                   │                │
//!               └───────────────────┴────────────────┘
//!                                   ▼
//!                        ┌──────────────────────┐
//!                        │ KvStore (AtomicOp)   │
//!                        └──────────────────────┘
//! ```
//!
//! Slice data never passes through the repositories. A [`SliceWriter`]
//! writes rows of an opened slice to the volume the slice was assigned to,
//! with the compression, disk sync and disk allocation settings stored in
//! the slice itself.
//!
//! ## Main Components
//!
//! - [`repository`]: file and slice lifecycle, see the state machines in
//!   [`sinkhouse_core::state`]
//! - [`statistics`]: records and bytes per level, moved with the entities
//! - [`definition`]: branches, sources, sinks and tokens
//! - [`volume`]: registered volumes and their assignment to files
//! - [`local`]: slice writer, codecs, disk sync and disk allocation
//! - [`quota`]: buffered bytes limit per sink

pub mod config;
pub mod definition;
pub mod error;
pub mod local;
pub mod quota;
pub mod repository;
pub mod schema;
pub mod statistics;
pub mod volume;

pub use config::{RepositoryConfig, StorageConfig};
pub use definition::{Branch, DefinitionRepository, Sink, Source, Token};
pub use error::{ErrorKind, Result, StorageError};
pub use local::{SliceWriter, WriterPool};
pub use quota::{BufferedBytesSource, QuotaChecker, QuotaConfig, QuotaError};
pub use repository::{
    FileImporter, FileRepository, FileResource, FileResourceProvider, Repository,
    SliceRepository, SliceUploader,
};
pub use statistics::StatisticsRepository;
pub use volume::{VolumeInfo, VolumeRegistration, VolumeRegistry};
