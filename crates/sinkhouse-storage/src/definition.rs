//! Definition repository
//!
//! Branches, sources, sinks and sink tokens. The storage pipeline only needs
//! to know that a sink exists, how it is configured and which token it uses;
//! the full definition API lives elsewhere.
//!
//! Reads used by other repositories go through the caller's [`Tx`], so an
//! operation that depends on a sink is retried if the sink changes while the
//! operation runs.

use crate::error::{Result, StorageError};
use crate::schema::definition as keys;
use serde::{Deserialize, Serialize};
use sinkhouse_core::{BranchKey, Column, KeyPrefix, SinkConfig, SinkKey, SourceKey};
use sinkhouse_metadata::{AtomicOp, KvStore, Tx};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub key: BranchKey,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub key: SourceKey,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sink {
    pub key: SinkKey,
    pub name: String,
    /// Destination table in the warehouse.
    pub table_id: String,
    pub columns: Vec<Column>,
    /// Per-sink overrides of the storage settings.
    #[serde(default)]
    pub config: SinkConfig,
}

/// API token used to provision file resources for a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub sink_key: SinkKey,
    pub token_id: String,
    pub token: String,
}

#[derive(Clone)]
pub struct DefinitionRepository {
    store: Arc<dyn KvStore>,
    op: AtomicOp,
}

impl DefinitionRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            op: AtomicOp::new(store.clone()),
            store,
        }
    }

    pub async fn create_branch(&self, branch: Branch) -> Result<Branch> {
        self.op
            .run("definition.create_branch", |tx| {
                let branch = branch.clone();
                async move {
                    let key = keys::branch(&branch.key);
                    if tx.exists(&key).await? {
                        return Err(StorageError::already_exists("branch", branch.key));
                    }
                    tx.put_json(key, &branch)?;
                    Ok(branch)
                }
            })
            .await
    }

    pub async fn create_source(&self, source: Source) -> Result<Source> {
        self.op
            .run("definition.create_source", |tx| {
                let source = source.clone();
                async move {
                    if !tx.exists(&keys::branch(&source.key.branch)).await? {
                        return Err(StorageError::not_found("branch", source.key.branch));
                    }
                    let key = keys::source(&source.key);
                    if tx.exists(&key).await? {
                        return Err(StorageError::already_exists("source", &source.key));
                    }
                    tx.put_json(key, &source)?;
                    Ok(source)
                }
            })
            .await
    }

    pub async fn create_sink(&self, sink: Sink) -> Result<Sink> {
        sink.config.validate()?;
        let created = self
            .op
            .run("definition.create_sink", |tx| {
                let sink = sink.clone();
                async move {
                    check_source(&tx, &sink.key.source).await?;
                    let key = keys::sink(&sink.key);
                    if tx.exists(&key).await? {
                        return Err(StorageError::already_exists("sink", &sink.key));
                    }
                    tx.put_json(key, &sink)?;
                    Ok(sink)
                }
            })
            .await?;
        info!(sink = %created.key, "sink created");
        Ok(created)
    }

    pub async fn update_sink(&self, sink: Sink) -> Result<Sink> {
        sink.config.validate()?;
        self.op
            .run("definition.update_sink", |tx| {
                let sink = sink.clone();
                async move {
                    read_sink(&tx, &sink.key).await?;
                    tx.put_json(keys::sink(&sink.key), &sink)?;
                    Ok(sink)
                }
            })
            .await
    }

    /// Deletes the sink and its token.
    pub async fn delete_sink(&self, key: &SinkKey) -> Result<()> {
        self.op
            .run("definition.delete_sink", |tx| async move {
                if !tx.exists(&keys::sink(key)).await? {
                    return Err(StorageError::not_found("sink", key));
                }
                tx.delete(keys::sink(key));
                tx.delete(keys::token(key));
                Ok(())
            })
            .await?;
        info!(sink = %key, "sink deleted");
        Ok(())
    }

    pub async fn get_sink(&self, key: &SinkKey) -> Result<Sink> {
        match self.store.get(&keys::sink(key)).await? {
            Some(kv) => Ok(kv.decode()?),
            None => Err(StorageError::not_found("sink", key)),
        }
    }

    pub async fn list_sinks_in(&self, parent: &impl KeyPrefix) -> Result<Vec<Sink>> {
        let resp = self.store.get_prefix(&keys::sinks_in(parent)).await?;
        resp.kvs
            .iter()
            .map(|kv| kv.decode().map_err(StorageError::from))
            .collect()
    }

    pub async fn put_token(&self, token: Token) -> Result<()> {
        self.op
            .run("definition.put_token", |tx| {
                let token = token.clone();
                async move {
                    read_sink(&tx, &token.sink_key).await?;
                    tx.put_json(keys::token(&token.sink_key), &token)?;
                    Ok(())
                }
            })
            .await
    }

    pub async fn get_token(&self, sink: &SinkKey) -> Result<Token> {
        match self.store.get(&keys::token(sink)).await? {
            Some(kv) => Ok(kv.decode()?),
            None => Err(StorageError::not_found("token", sink)),
        }
    }
}

async fn check_source(tx: &Tx, key: &SourceKey) -> Result<()> {
    if !tx.exists(&keys::branch(&key.branch)).await? {
        return Err(StorageError::not_found("branch", key.branch));
    }
    if !tx.exists(&keys::source(key)).await? {
        return Err(StorageError::not_found("source", key));
    }
    Ok(())
}

/// Reads the sink inside `tx`, failing with `NotFound` naming the first
/// missing ancestor.
pub(crate) async fn read_sink(tx: &Tx, key: &SinkKey) -> Result<Sink> {
    check_source(tx, &key.source).await?;
    match tx.get_json::<Sink>(&keys::sink(key)).await? {
        Some(sink) => Ok(sink),
        None => Err(StorageError::not_found("sink", key)),
    }
}

/// Lists sinks under `parent` inside `tx`.
pub(crate) async fn read_sinks_in(tx: &Tx, parent: &str) -> Result<Vec<Sink>> {
    Ok(tx
        .get_prefix_json::<Sink>(&format!("{}{}", keys::sinks_prefix(), parent))
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use sinkhouse_metadata::MemoryKvStore;

    fn repo() -> DefinitionRepository {
        DefinitionRepository::new(Arc::new(MemoryKvStore::new()))
    }

    fn sink_key() -> SinkKey {
        let source = SourceKey::new(BranchKey::new(123, 456), "my-source").unwrap();
        SinkKey::new(source, "my-sink").unwrap()
    }

    fn sink() -> Sink {
        Sink {
            key: sink_key(),
            name: "My Sink".into(),
            table_id: "in.c-bucket.table".into(),
            columns: vec![Column::new("body")],
            config: SinkConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_create_sink_requires_parents() {
        let repo = repo();
        let err = repo.create_sink(sink()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "branch \"123/456\" not found");

        repo.create_branch(Branch {
            key: BranchKey::new(123, 456),
            is_default: true,
        })
        .await
        .unwrap();
        let err = repo.create_sink(sink()).await.unwrap_err();
        assert_eq!(err.to_string(), "source \"123/456/my-source\" not found");

        repo.create_source(Source {
            key: sink_key().source,
            name: "My Source".into(),
        })
        .await
        .unwrap();
        repo.create_sink(sink()).await.unwrap();

        let err = repo.create_sink(sink()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        assert_eq!(repo.get_sink(&sink_key()).await.unwrap(), sink());
        assert_eq!(
            repo.list_sinks_in(&sink_key().source.branch).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_delete_sink_removes_token() {
        let repo = repo();
        repo.create_branch(Branch {
            key: BranchKey::new(123, 456),
            is_default: true,
        })
        .await
        .unwrap();
        repo.create_source(Source {
            key: sink_key().source,
            name: "My Source".into(),
        })
        .await
        .unwrap();
        repo.create_sink(sink()).await.unwrap();
        repo.put_token(Token {
            sink_key: sink_key(),
            token_id: "1".into(),
            token: "secret".into(),
        })
        .await
        .unwrap();

        repo.delete_sink(&sink_key()).await.unwrap();
        assert_eq!(
            repo.get_token(&sink_key()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            repo.delete_sink(&sink_key()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
