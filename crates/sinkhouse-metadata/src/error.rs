//! Metadata Error Types
//!
//! Errors raised by the key-value store abstraction and the helpers built on
//! top of it.
//!
//! ## Error Categories
//!
//! ### Lease Errors
//! - `LeaseNotFound`: The lease expired or was revoked
//!
//! ### Concurrency Errors
//! - `TooManyConflicts`: An atomic operation kept losing the compare-and-swap
//!   race and gave up. Single conflicts are retried internally and never
//!   reach the caller.
//!
//! ### Watch Errors
//! - `WatchLagged`: A watcher fell behind and missed events, it must resync
//!
//! ### Data Errors
//! - `Decode`: A stored value is not valid JSON for the expected type
//! - `Serialization`: A value could not be encoded
//!
//! ## Usage
//!
//! ```ignore
//! use sinkhouse_metadata::{KvStore, MetadataError, Result};
//!
//! async fn example(store: &dyn KvStore) -> Result<()> {
//!     match store.keep_alive(lease).await {
//!         Ok(()) => {}
//!         Err(MetadataError::LeaseNotFound(id)) => {
//!             // re-register under a new lease
//!         }
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```

use crate::kv::LeaseId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("atomic operation \"{operation}\" failed after {attempts} attempts: too many conflicts")]
    TooManyConflicts { operation: String, attempts: u32 },

    #[error("watch lagged behind by {0} responses")]
    WatchLagged(u64),

    #[error("cannot decode key \"{key}\": {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
