//! Staging upload credentials
//!
//! Each staging backend hands out temporary credentials with its own way of
//! expressing when they stop working. `HasExpiration` gives every backend a
//! single answer, so callers never branch on the backend type.

use crate::time::UtcTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub trait HasExpiration {
    fn expiration(&self) -> UtcTime;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Credentials {
    pub bucket: String,
    pub key_prefix: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: UtcTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsCredentials {
    pub account_name: String,
    pub container: String,
    pub sas_connection_string: String,
    pub expiration: UtcTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcsCredentials {
    pub bucket: String,
    pub key_prefix: String,
    pub access_token: String,
    pub issued_at: UtcTime,
    /// Token lifetime in seconds, counted from `issued_at`.
    pub expires_in: u64,
}

impl HasExpiration for S3Credentials {
    fn expiration(&self) -> UtcTime {
        self.expiration
    }
}

impl HasExpiration for AbsCredentials {
    fn expiration(&self) -> UtcTime {
        self.expiration
    }
}

impl HasExpiration for GcsCredentials {
    fn expiration(&self) -> UtcTime {
        self.issued_at.plus(Duration::from_secs(self.expires_in))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum UploadCredentials {
    S3(S3Credentials),
    Abs(AbsCredentials),
    Gcs(GcsCredentials),
}

impl HasExpiration for UploadCredentials {
    fn expiration(&self) -> UtcTime {
        match self {
            UploadCredentials::S3(c) => c.expiration(),
            UploadCredentials::Abs(c) => c.expiration(),
            UploadCredentials::Gcs(c) => c.expiration(),
        }
    }
}
