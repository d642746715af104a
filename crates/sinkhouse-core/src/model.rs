//! File and Slice entities
//!
//! A **File** is the unit that ends up imported into one target table. It is
//! spread over one or more disk volumes; each volume holds a **Slice** of the
//! file. Slices are uploaded to staging storage independently, the file is
//! imported once all of its slices are uploaded.
//!
//! ```text
//! File 123/456/src/sink/2000-01-01T01:00:00.000Z     (Writing)
//!   ├── Slice .../vol-1/2000-01-01T01:00:00.000Z     (Writing)
//!   └── Slice .../vol-2/2000-01-01T01:00:00.000Z     (Writing)
//! ```
//!
//! State changes go through `with_state`, which checks the edge, stamps the
//! transition time and clears retry information.

use crate::config::{
    AssignmentConfig, CompressionConfig, LocalStorageConfig, SinkConfig, SyncConfig,
};
use crate::credentials::UploadCredentials;
use crate::error::{CoreError, Result};
use crate::key::{FileKey, SliceKey, VolumeId};
use crate::retry::Retryable;
use crate::size::ByteSize;
use crate::state::{FileState, Level, SliceState};
use crate::time::UtcTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Csv,
}

impl FileType {
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default)]
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
        }
    }
}

/// Volumes assigned to a file, one slice per volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub config: AssignmentConfig,
    pub volumes: Vec<VolumeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFile {
    /// Directory of the file relative to the volume root.
    pub dir: String,
    pub config: LocalStorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingFile {
    pub compression: CompressionConfig,
    pub credentials: UploadCredentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFile {
    pub table_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub key: FileKey,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub state: FileState,
    pub columns: Vec<Column>,
    pub assignment: Assignment,
    pub local_storage: LocalFile,
    pub staging_storage: StagingFile,
    pub target_storage: TargetFile,
    #[serde(flatten)]
    pub retry: Retryable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
}

impl File {
    /// Opens a new file in the `Writing` state.
    pub fn new(
        key: FileKey,
        config: &SinkConfig,
        columns: Vec<Column>,
        volumes: Vec<VolumeId>,
        credentials: UploadCredentials,
        table_id: impl Into<String>,
    ) -> File {
        File {
            local_storage: LocalFile {
                dir: file_dir(&key),
                config: config.local,
            },
            staging_storage: StagingFile {
                compression: config.staging_compression,
                credentials,
            },
            target_storage: TargetFile {
                table_id: table_id.into(),
                import_job_id: None,
            },
            key,
            file_type: FileType::Csv,
            state: FileState::Writing,
            columns,
            assignment: Assignment {
                config: config.assignment.clone(),
                volumes,
            },
            retry: Retryable::default(),
            closing_at: None,
            importing_at: None,
            imported_at: None,
        }
    }

    pub fn opened_at(&self) -> UtcTime {
        self.key.opened_at
    }

    pub fn level(&self) -> Level {
        self.state.level()
    }

    /// Time of the last state transition, the opening time for a new file.
    pub fn last_state_change(&self) -> UtcTime {
        self.imported_at
            .or(self.importing_at)
            .or(self.closing_at)
            .unwrap_or(self.key.opened_at)
    }

    /// Returns a copy in the `to` state.
    pub fn with_state(&self, now: UtcTime, to: FileState) -> Result<File> {
        if !self.state.can_transit_to(to) {
            return Err(CoreError::InvalidTransition(format!(
                "unexpected file \"{}\" state transition from \"{}\" to \"{}\"",
                self.key, self.state, to
            )));
        }
        let mut file = self.clone();
        file.state = to;
        file.retry.reset();
        match to {
            FileState::Closing => file.closing_at = Some(now),
            FileState::Importing => file.importing_at = Some(now),
            FileState::Imported => file.imported_at = Some(now),
            FileState::Writing => {}
        }
        Ok(file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSlice {
    /// Directory of the slice relative to the volume root.
    pub dir: String,
    pub filename: String,
    /// Space pre-allocated for the slice file, zero if disabled.
    pub allocated_disk_space: ByteSize,
    pub compression: CompressionConfig,
    pub disk_sync: SyncConfig,
}

impl LocalSlice {
    pub fn path(&self) -> String {
        format!("{}/{}", self.dir, self.filename)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingSlice {
    /// Object path inside the staging storage.
    pub path: String,
    pub compression: CompressionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    pub key: SliceKey,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub state: SliceState,
    pub columns: Vec<Column>,
    pub local_storage: LocalSlice,
    pub staging_storage: StagingSlice,
    #[serde(flatten)]
    pub retry: Retryable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploading_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
}

impl Slice {
    /// Opens a new slice of `file` in `volume_id`.
    pub fn new(
        file: &File,
        volume_id: VolumeId,
        opened_at: UtcTime,
        allocated_disk_space: ByteSize,
    ) -> Slice {
        let key = file.key.volume(volume_id).slice(opened_at);
        let local = &file.local_storage;
        let filename = format!(
            "slice.{}{}",
            file.file_type.extension(),
            local.config.compression.file_extension()
        );
        let staging_path = format!(
            "{}_{}.{}{}",
            opened_at.unix_millis(),
            key.volume_id(),
            file.file_type.extension(),
            file.staging_storage.compression.file_extension()
        );
        Slice {
            file_type: file.file_type,
            state: SliceState::Writing,
            columns: file.columns.clone(),
            local_storage: LocalSlice {
                dir: format!("{}/{}", local.dir, slice_dir_name(opened_at)),
                filename,
                allocated_disk_space,
                compression: local.config.compression,
                disk_sync: local.config.disk_sync,
            },
            staging_storage: StagingSlice {
                path: staging_path,
                compression: file.staging_storage.compression,
            },
            retry: Retryable::default(),
            closing_at: None,
            uploading_at: None,
            uploaded_at: None,
            imported_at: None,
            key,
        }
    }

    pub fn opened_at(&self) -> UtcTime {
        self.key.opened_at
    }

    pub fn level(&self) -> Level {
        self.state.level()
    }

    /// Returns a copy in the `to` state.
    pub fn with_state(&self, now: UtcTime, to: SliceState) -> Result<Slice> {
        if !self.state.can_transit_to(to) {
            return Err(CoreError::InvalidTransition(format!(
                "unexpected slice \"{}\" state transition from \"{}\" to \"{}\"",
                self.key, self.state, to
            )));
        }
        let mut slice = self.clone();
        slice.state = to;
        slice.retry.reset();
        match to {
            SliceState::Closing => slice.closing_at = Some(now),
            SliceState::Uploading => slice.uploading_at = Some(now),
            SliceState::Uploaded => slice.uploaded_at = Some(now),
            SliceState::Imported => slice.imported_at = Some(now),
            SliceState::Writing => {}
        }
        Ok(slice)
    }
}

/// Directory names must be valid on every filesystem, so `:` is replaced.
fn slice_dir_name(opened_at: UtcTime) -> String {
    opened_at.to_string().replace(':', "-")
}

/// Directory of a file relative to the volume root.
pub fn file_dir(key: &FileKey) -> String {
    let sink = &key.sink;
    format!(
        "{}/{}/{}/{}/{}",
        sink.project_id(),
        sink.source.branch.branch_id,
        sink.source.source_id,
        sink.sink_id,
        slice_dir_name(key.opened_at)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::GcsCredentials;
    use crate::key::{BranchKey, SinkKey, SourceKey};
    use crate::time::must_parse;

    fn test_file() -> File {
        let source = SourceKey::new(BranchKey::new(123, 456), "my-source").unwrap();
        let sink = SinkKey::new(source, "my-sink").unwrap();
        let opened_at = must_parse("2000-01-01T01:00:00.000Z");
        let credentials = UploadCredentials::Gcs(GcsCredentials {
            bucket: "bucket".into(),
            key_prefix: "prefix".into(),
            access_token: "token".into(),
            issued_at: opened_at,
            expires_in: 3600,
        });
        File::new(
            FileKey::new(sink, opened_at),
            &SinkConfig::default(),
            vec![Column::new("id"), Column::new("body")],
            vec![VolumeId::new("vol-1").unwrap()],
            credentials,
            "in.c-bucket.table",
        )
    }

    #[test]
    fn test_file_transitions() {
        let file = test_file();
        let now = must_parse("2000-01-01T02:00:00.000Z");

        let closing = file.with_state(now, FileState::Closing).unwrap();
        assert_eq!(closing.state, FileState::Closing);
        assert_eq!(closing.closing_at, Some(now));

        let err = file.with_state(now, FileState::Imported).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected file \"123/456/my-source/my-sink/2000-01-01T01:00:00.000Z\" state transition from \"writing\" to \"imported\""
        );
    }

    #[test]
    fn test_last_state_change() {
        let file = test_file();
        assert_eq!(file.last_state_change(), file.key.opened_at);

        let closing_at = must_parse("2000-01-01T02:00:00.000Z");
        let importing_at = must_parse("2000-01-01T02:05:00.000Z");
        let file = file
            .with_state(closing_at, FileState::Closing)
            .unwrap()
            .with_state(importing_at, FileState::Importing)
            .unwrap();
        assert_eq!(file.last_state_change(), importing_at);
    }

    #[test]
    fn test_transition_resets_retry() {
        let mut file = test_file();
        file.retry.increment(
            &crate::retry::RetryBackoff::default(),
            must_parse("2000-01-01T01:30:00.000Z"),
            "some error",
        );
        let closing = file
            .with_state(must_parse("2000-01-01T02:00:00.000Z"), FileState::Closing)
            .unwrap();
        assert_eq!(closing.retry, Retryable::default());
    }

    #[test]
    fn test_new_slice() {
        let file = test_file();
        let opened_at = must_parse("2000-01-01T01:00:00.000Z");
        let slice = Slice::new(
            &file,
            VolumeId::new("vol-1").unwrap(),
            opened_at,
            ByteSize::mb(100),
        );
        assert_eq!(slice.state, SliceState::Writing);
        assert_eq!(slice.key.file(), &file.key);
        assert_eq!(slice.local_storage.filename, "slice.csv.gz");
        assert_eq!(
            slice.local_storage.dir,
            "123/456/my-source/my-sink/2000-01-01T01-00-00.000Z/2000-01-01T01-00-00.000Z"
        );
        assert_eq!(slice.staging_storage.path, "946688400000_vol-1.csv.gz");
    }

    #[test]
    fn test_json_round_trip_keeps_flattened_retry() {
        let mut file = test_file();
        file.retry.increment(
            &crate::retry::RetryBackoff::default(),
            must_parse("2000-01-01T01:30:00.000Z"),
            "some error",
        );
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["retry_attempt"], 1);
        let back: File = serde_json::from_value(json).unwrap();
        assert_eq!(back, file);
    }
}
