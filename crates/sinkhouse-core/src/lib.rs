//! sinkhouse core types
//!
//! Shared vocabulary of the storage pipeline: entity keys, the File/Slice
//! entities and their state machines, statistics values, retry bookkeeping,
//! upload credentials and configuration. Nothing in this crate performs I/O.
//!
//! ## Modules
//!
//! - [`key`]: hierarchical keys from project down to slice
//! - [`state`]: file/slice states, levels and the valid combination table
//! - [`model`]: `File` and `Slice` entities
//! - [`statistics`]: per-level counters and aggregates
//! - [`config`]: compression, disk sync, disk allocation, assignment and
//!   condition settings
//! - [`credentials`]: staging credentials with a uniform expiration
//! - [`retry`]: exponential retry backoff

pub mod config;
pub mod credentials;
pub mod error;
pub mod key;
pub mod model;
pub mod retry;
pub mod size;
pub mod state;
pub mod statistics;
pub mod time;

pub use config::{
    AllocConfig, AssignmentConfig, CompressionConfig, CompressionType, Conditions,
    ConditionsConfig, LocalStorageConfig, SinkConfig, SyncConfig, SyncMode,
};
pub use credentials::{HasExpiration, UploadCredentials};
pub use error::{CoreError, Result};
pub use key::{
    BranchId, BranchKey, FileKey, FileVolumeKey, KeyPrefix, ProjectId, SinkId, SinkKey, SliceKey,
    SourceId, SourceKey, VolumeId,
};
pub use model::{file_dir, Column, File, FileType, Slice};
pub use retry::{RetryBackoff, Retryable};
pub use size::ByteSize;
pub use state::{
    cascade_slice_state, is_valid_combination, validate_combination, FileState, Level, SliceState,
};
pub use statistics::{Aggregated, Value};
pub use time::UtcTime;
