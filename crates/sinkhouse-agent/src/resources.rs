//! Static staging resources
//!
//! Hands out GCS style upload credentials from configuration instead of
//! calling a staging API. Credentials are issued when the file is opened.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sinkhouse_core::credentials::GcsCredentials;
use sinkhouse_core::{FileKey, UploadCredentials};
use sinkhouse_storage::{FileResource, FileResourceProvider, Sink, Token};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticResourceConfig {
    pub bucket: String,

    #[serde(default)]
    pub key_prefix: String,

    #[serde(default)]
    pub access_token: String,

    /// Lifetime of issued credentials in seconds (default: 6h)
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    6 * 3600
}

impl Default for StaticResourceConfig {
    fn default() -> Self {
        Self {
            bucket: "sinkhouse-staging".to_string(),
            key_prefix: String::new(),
            access_token: String::new(),
            expires_in: default_expires_in(),
        }
    }
}

pub struct StaticResourceProvider {
    config: StaticResourceConfig,
    created: AtomicU64,
    deleted: AtomicU64,
}

impl StaticResourceProvider {
    pub fn new(config: StaticResourceConfig) -> Self {
        Self {
            config,
            created: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        }
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FileResourceProvider for StaticResourceProvider {
    async fn create(
        &self,
        file_key: &FileKey,
        _sink: &Sink,
        _token: Option<&Token>,
    ) -> sinkhouse_storage::Result<FileResource> {
        let seq = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        let key_prefix = if self.config.key_prefix.is_empty() {
            file_key.to_string()
        } else {
            format!("{}/{}", self.config.key_prefix.trim_end_matches('/'), file_key)
        };
        debug!(file = %file_key, seq, "staging resource created");
        Ok(FileResource {
            file_key: file_key.clone(),
            id: format!("static-{seq}"),
            credentials: UploadCredentials::Gcs(GcsCredentials {
                bucket: self.config.bucket.clone(),
                key_prefix,
                access_token: self.config.access_token.clone(),
                issued_at: file_key.opened_at,
                expires_in: self.config.expires_in,
            }),
        })
    }

    async fn delete(&self, resource: &FileResource) -> sinkhouse_storage::Result<()> {
        self.deleted.fetch_add(1, Ordering::Relaxed);
        debug!(file = %resource.file_key, id = %resource.id, "staging resource deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sinkhouse_core::time::must_parse;
    use sinkhouse_core::{BranchKey, HasExpiration, SinkConfig, SinkKey, SourceKey};

    #[tokio::test]
    async fn test_credentials_follow_file() {
        let provider = StaticResourceProvider::new(StaticResourceConfig {
            key_prefix: "exports/".into(),
            expires_in: 3600,
            ..Default::default()
        });
        let source = SourceKey::new(BranchKey::new(1, 2), "source").unwrap();
        let sink_key = SinkKey::new(source, "sink").unwrap();
        let opened_at = must_parse("2000-01-01T00:00:00.000Z");
        let file_key = FileKey::new(sink_key.clone(), opened_at);
        let sink = Sink {
            key: sink_key,
            name: "sink".into(),
            table_id: "in.c-bucket.table".into(),
            columns: vec![],
            config: SinkConfig::default(),
        };

        let resource = provider.create(&file_key, &sink, None).await.unwrap();
        assert_eq!(resource.id, "static-1");
        assert_eq!(
            resource.credentials.expiration(),
            must_parse("2000-01-01T01:00:00.000Z")
        );
        let UploadCredentials::Gcs(gcs) = &resource.credentials else {
            panic!("expected gcs credentials");
        };
        assert_eq!(gcs.key_prefix, format!("exports/{file_key}"));

        provider.delete(&resource).await.unwrap();
        assert_eq!((provider.created(), provider.deleted()), (1, 1));
    }
}
