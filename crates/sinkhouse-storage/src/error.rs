//! Storage Error Types
//!
//! This module defines all error types returned by the repositories, the
//! volume registry, the quota checker and the local disk mechanics.
//!
//! ## Error Categories
//!
//! ### Entity Errors
//! - `NotFound`: A parent definition or the entity itself does not exist
//! - `AlreadyExists`: An entity with the same key was already created
//! - `BadRequest`: Invalid state transition or invalid (file, slice) state
//!   combination; a caller error, never transient
//!
//! ### Provisioning Errors
//! - `NoVolumeAvailable`: No writable volume satisfies the assignment
//! - `Upstream`: An external service (file resources, credentials) failed
//!
//! ### Backpressure
//! - `QuotaExceeded`: The receiver buffers more than the configured limit
//!
//! ### Infrastructure Errors
//! - `Metadata`: Store operation failed (includes exhausted CAS retries)
//! - `Io`: Local disk operation failed
//!
//! ## Usage
//!
//! Callers match on [`StorageError::kind`] instead of individual variants:
//!
//! ```ignore
//! match files.rotate(now, &sink).await {
//!     Ok(file) => {}
//!     Err(e) if e.kind() == ErrorKind::NotFound => { /* sink was deleted */ }
//!     Err(e) => return Err(e),
//! }
//! ```

use crate::quota::QuotaError;
use sinkhouse_core::CoreError;
use sinkhouse_metadata::MetadataError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    NoVolumeAvailable,
    Upstream,
    QuotaExceeded,
    Internal,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} \"{key}\" not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} \"{key}\" already exists")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("no volume is available for the file")]
    NoVolumeAvailable,

    #[error("{entity}: {message}")]
    Upstream { entity: String, message: String },

    #[error(transparent)]
    QuotaExceeded(#[from] QuotaError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    Invalid(String),
}

impl StorageError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StorageError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn already_exists(entity: &'static str, key: impl ToString) -> Self {
        StorageError::AlreadyExists {
            entity,
            key: key.to_string(),
        }
    }

    pub fn upstream(entity: impl ToString, message: impl ToString) -> Self {
        StorageError::Upstream {
            entity: entity.to_string(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound { .. } => ErrorKind::NotFound,
            StorageError::AlreadyExists { .. } => ErrorKind::Conflict,
            StorageError::BadRequest(_) => ErrorKind::BadRequest,
            StorageError::NoVolumeAvailable => ErrorKind::NoVolumeAvailable,
            StorageError::Upstream { .. } => ErrorKind::Upstream,
            StorageError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            StorageError::Metadata(_) | StorageError::Io(_) | StorageError::Invalid(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<CoreError> for StorageError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidTransition(msg) | CoreError::InvalidCombination(msg) => {
                StorageError::BadRequest(msg)
            }
            CoreError::InvalidKey(msg) => StorageError::BadRequest(format!("invalid key: {msg}")),
            CoreError::InvalidConfig(msg) => {
                StorageError::BadRequest(format!("invalid config: {msg}"))
            }
            other => StorageError::Invalid(other.to_string()),
        }
    }
}
