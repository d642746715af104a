//! Directory staging
//!
//! Uploads and imports into local directories instead of a staging service
//! and a table API. Useful for a single node and in tests:
//!
//! ```text
//!   <volume>/<slice dir>/slice.csv.gz
//!       │ upload: decode local codec, encode staging codec
//!       ▼
//!   <staging>/<file dir>/<staging path>
//!       │ import: decode and append every slice of the file
//!       ▼
//!   <target>/<table id>/<file dir>.csv
//! ```
//!
//! File IO runs on the blocking pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sinkhouse_core::{file_dir, File, Slice, VolumeId};
use sinkhouse_storage::local::{Decoder, Encoder};
use sinkhouse_storage::{FileImporter, SliceUploader, StorageError};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStagingConfig {
    /// Root of the uploaded slices
    pub staging_dir: PathBuf,

    /// Root of the imported tables
    pub target_dir: PathBuf,
}

impl Default for DirectoryStagingConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("/var/lib/sinkhouse/staging"),
            target_dir: PathBuf::from("/var/lib/sinkhouse/target"),
        }
    }
}

pub struct DirectoryStaging {
    config: DirectoryStagingConfig,
    volumes: HashMap<VolumeId, PathBuf>,
}

impl DirectoryStaging {
    pub fn new(config: DirectoryStagingConfig, volumes: HashMap<VolumeId, PathBuf>) -> Self {
        Self { config, volumes }
    }

    /// Path of the uploaded slice in the staging directory.
    pub fn staged_path(&self, slice: &Slice) -> PathBuf {
        self.config
            .staging_dir
            .join(file_dir(slice.key.file()))
            .join(&slice.staging_storage.path)
    }

    /// Path of the imported file in the target directory.
    pub fn target_path(&self, file: &File) -> PathBuf {
        self.config
            .target_dir
            .join(&file.target_storage.table_id)
            .join(format!("{}.csv", file_dir(&file.key)))
    }
}

#[async_trait]
impl SliceUploader for DirectoryStaging {
    async fn upload(&self, slice: &Slice, _file: &File) -> sinkhouse_storage::Result<()> {
        let volume = self
            .volumes
            .get(slice.key.volume_id())
            .ok_or_else(|| StorageError::not_found("volume", slice.key.volume_id()))?;
        let src = volume.join(slice.local_storage.path());
        let dst = self.staged_path(slice);
        let local = slice.local_storage.compression;
        let staging = slice.staging_storage.compression;

        let copied = blocking(move || {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut decoder = Decoder::new(local.kind, BufReader::new(fs::File::open(&src)?))?;
            let mut encoder = Encoder::new(&staging, BufWriter::new(fs::File::create(&dst)?))?;
            let copied = io::copy(&mut decoder, &mut encoder)?;
            encoder.finish()?.flush()?;
            Ok(copied)
        })
        .await?;
        debug!(slice = %slice.key, bytes = copied, "slice uploaded");
        Ok(())
    }
}

#[async_trait]
impl FileImporter for DirectoryStaging {
    async fn import(&self, file: &File, slices: &[Slice]) -> sinkhouse_storage::Result<()> {
        let sources: Vec<(PathBuf, Slice)> = slices
            .iter()
            .map(|s| (self.staged_path(s), s.clone()))
            .collect();
        let dst = self.target_path(file);
        let count = sources.len();

        blocking(move || {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = BufWriter::new(fs::File::create(&dst)?);
            for (path, slice) in &sources {
                let input = match fs::File::open(path) {
                    Ok(f) => f,
                    // Slices without records are never uploaded.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };
                let mut decoder =
                    Decoder::new(slice.staging_storage.compression.kind, BufReader::new(input))?;
                io::copy(&mut decoder, &mut out)?;
            }
            out.flush()?;
            for (path, _) in &sources {
                remove_if_exists(path)?;
            }
            Ok(())
        })
        .await?;
        info!(file = %file.key, slices = count, "file imported");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn blocking<T, F>(f: F) -> sinkhouse_storage::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io(io::Error::new(io::ErrorKind::Other, e)))?
        .map_err(StorageError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sinkhouse_core::credentials::GcsCredentials;
    use sinkhouse_core::time::must_parse;
    use sinkhouse_core::{
        BranchKey, ByteSize, Column, CompressionConfig, FileKey, SinkConfig, SinkKey, SourceKey,
        SyncConfig, UploadCredentials,
    };
    use sinkhouse_storage::local::SetLenAllocator;
    use sinkhouse_storage::SliceWriter;

    fn file() -> File {
        let source = SourceKey::new(BranchKey::new(123, 456), "my-source").unwrap();
        let sink = SinkKey::new(source, "my-sink").unwrap();
        let opened_at = must_parse("2000-01-01T01:00:00.000Z");
        let mut config = SinkConfig::default();
        config.local.compression = CompressionConfig::zstd();
        config.local.disk_sync = SyncConfig::disabled();
        File::new(
            FileKey::new(sink, opened_at),
            &config,
            vec![Column::new("id"), Column::new("body")],
            vec![VolumeId::new("vol-1").unwrap(), VolumeId::new("vol-2").unwrap()],
            UploadCredentials::Gcs(GcsCredentials {
                bucket: "bucket".into(),
                key_prefix: "prefix".into(),
                access_token: "token".into(),
                issued_at: opened_at,
                expires_in: 3600,
            }),
            "in.c-bucket.table",
        )
    }

    async fn write_slice(volume: &Path, slice: &Slice, rows: &[(&str, &str)]) {
        let writer = SliceWriter::open(volume, slice, &SetLenAllocator).unwrap();
        for (id, body) in rows {
            writer
                .write_row(slice.key.opened_at, &[id.to_string(), body.to_string()])
                .await
                .unwrap();
        }
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_and_import() {
        let root = tempfile::tempdir().unwrap();
        let vol1 = root.path().join("vol-1");
        let vol2 = root.path().join("vol-2");
        let staging = DirectoryStaging::new(
            DirectoryStagingConfig {
                staging_dir: root.path().join("staging"),
                target_dir: root.path().join("target"),
            },
            HashMap::from([
                (VolumeId::new("vol-1").unwrap(), vol1.clone()),
                (VolumeId::new("vol-2").unwrap(), vol2.clone()),
            ]),
        );

        let file = file();
        let opened_at = file.key.opened_at;
        let first = Slice::new(&file, VolumeId::new("vol-1").unwrap(), opened_at, ByteSize::ZERO);
        let second = Slice::new(&file, VolumeId::new("vol-2").unwrap(), opened_at, ByteSize::ZERO);
        write_slice(&vol1, &first, &[("1", "foo"), ("2", "bar")]).await;
        write_slice(&vol2, &second, &[("3", "baz")]).await;

        staging.upload(&first, &file).await.unwrap();
        staging.upload(&second, &file).await.unwrap();
        assert!(staging.staged_path(&first).exists());

        staging.import(&file, &[first.clone(), second.clone()]).await.unwrap();
        let imported = fs::read_to_string(staging.target_path(&file)).unwrap();
        assert_eq!(imported, "1,foo\n2,bar\n3,baz\n");
        assert!(!staging.staged_path(&first).exists());
        assert!(staging
            .target_path(&file)
            .starts_with(root.path().join("target").join("in.c-bucket.table")));
    }

    #[tokio::test]
    async fn test_upload_missing_data() {
        let root = tempfile::tempdir().unwrap();
        let staging = DirectoryStaging::new(
            DirectoryStagingConfig {
                staging_dir: root.path().join("staging"),
                target_dir: root.path().join("target"),
            },
            HashMap::from([(VolumeId::new("vol-1").unwrap(), root.path().join("vol-1"))]),
        );
        let file = file();
        let on_vol1 = Slice::new(&file, VolumeId::new("vol-1").unwrap(), file.key.opened_at, ByteSize::ZERO);
        let on_vol2 = Slice::new(&file, VolumeId::new("vol-2").unwrap(), file.key.opened_at, ByteSize::ZERO);

        let err = staging.upload(&on_vol1, &file).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        let err = staging.upload(&on_vol2, &file).await.unwrap_err();
        assert_eq!(err.to_string(), "volume \"vol-2\" not found");
    }
}
