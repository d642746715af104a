//! Error Types for sinkhouse core
//!
//! Errors raised while parsing keys and timestamps, validating configuration,
//! or applying an entity state change.
//!
//! ## Error Categories
//!
//! ### Parsing Errors
//! - `InvalidKey`: An entity key does not have the expected shape
//! - `InvalidTime`: A timestamp is not RFC 3339
//!
//! ### State Errors
//! - `InvalidTransition`: A file/slice state change is not an allowed edge,
//!   or the entity is not in the expected source state
//! - `InvalidCombination`: The resulting (file state, slice state) pair is
//!   not in the allowed table
//!
//! ### Configuration Errors
//! - `InvalidConfig`: A config value is out of range
//!
//! Repositories map state errors to their `BadRequest` class.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid time: {0}")]
    InvalidTime(String),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("{0}")]
    InvalidCombination(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
