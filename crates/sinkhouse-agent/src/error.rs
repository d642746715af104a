//! Error types for sinkhouse Agent

use sinkhouse_metadata::MetadataError;
use sinkhouse_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("distribution node \"{0}\" is already registered in the group")]
    NodeAlreadyRegistered(String),

    #[error("distribution node \"{node_id}\" did not see itself in the group within {timeout_ms} ms")]
    StartupTimeout { node_id: String, timeout_ms: u64 },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
