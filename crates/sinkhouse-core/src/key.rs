//! Entity keys
//!
//! Every stored entity is addressed by a hierarchical key. Each level of the
//! hierarchy embeds its parent, so a key can always be narrowed back to any
//! ancestor:
//!
//! ```text
//! ProjectId      123
//! BranchKey      123/456
//! SourceKey      123/456/my-source
//! SinkKey        123/456/my-source/my-sink
//! FileKey        123/456/my-source/my-sink/2000-01-01T01:00:00.000Z
//! FileVolumeKey  123/456/my-source/my-sink/2000-01-01T01:00:00.000Z/my-volume
//! SliceKey       123/456/my-source/my-sink/2000-01-01T01:00:00.000Z/my-volume/2000-01-01T01:00:00.000Z
//! ```
//!
//! The string form is used verbatim inside store keys, so listing all
//! entities below an ancestor is a prefix scan over `ancestor.prefix()`.

use crate::error::{CoreError, Result};
use crate::time::UtcTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Anything that can narrow a prefix scan: the key of an ancestor entity.
pub trait KeyPrefix {
    /// Key followed by `/`, so `123/4` never matches `123/45`.
    fn prefix(&self) -> String;
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                if id.is_empty() || id.contains('/') {
                    return Err(CoreError::InvalidKey(format!(
                        "{} {:?} must be non-empty and must not contain '/'",
                        stringify!($name),
                        id
                    )));
                }
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

macro_rules! string_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl KeyPrefix for $name {
            fn prefix(&self) -> String {
                format!("{}/", self)
            }
        }
    };
}

string_id!(SourceId);
string_id!(SinkId);
string_id!(VolumeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl KeyPrefix for ProjectId {
    fn prefix(&self) -> String {
        format!("{}/", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchKey {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceKey {
    pub branch: BranchKey,
    pub source_id: SourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SinkKey {
    pub source: SourceKey,
    pub sink_id: SinkId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileKey {
    pub sink: SinkKey,
    pub opened_at: UtcTime,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileVolumeKey {
    pub file: FileKey,
    pub volume_id: VolumeId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SliceKey {
    pub file_volume: FileVolumeKey,
    pub opened_at: UtcTime,
}

impl BranchKey {
    pub fn new(project_id: u64, branch_id: u64) -> Self {
        Self {
            project_id: ProjectId(project_id),
            branch_id: BranchId(branch_id),
        }
    }
}

impl SourceKey {
    pub fn new(branch: BranchKey, source_id: &str) -> Result<Self> {
        Ok(Self {
            branch,
            source_id: SourceId::new(source_id)?,
        })
    }
}

impl SinkKey {
    pub fn new(source: SourceKey, sink_id: &str) -> Result<Self> {
        Ok(Self {
            source,
            sink_id: SinkId::new(sink_id)?,
        })
    }

    pub fn project_id(&self) -> ProjectId {
        self.source.branch.project_id
    }
}

impl FileKey {
    pub fn new(sink: SinkKey, opened_at: UtcTime) -> Self {
        Self { sink, opened_at }
    }

    pub fn sink(&self) -> &SinkKey {
        &self.sink
    }

    pub fn volume(&self, volume_id: VolumeId) -> FileVolumeKey {
        FileVolumeKey {
            file: self.clone(),
            volume_id,
        }
    }
}

impl FileVolumeKey {
    pub fn file(&self) -> &FileKey {
        &self.file
    }

    pub fn slice(&self, opened_at: UtcTime) -> SliceKey {
        SliceKey {
            file_volume: self.clone(),
            opened_at,
        }
    }
}

impl SliceKey {
    pub fn file(&self) -> &FileKey {
        &self.file_volume.file
    }

    pub fn file_volume(&self) -> &FileVolumeKey {
        &self.file_volume
    }

    pub fn sink(&self) -> &SinkKey {
        &self.file_volume.file.sink
    }

    pub fn volume_id(&self) -> &VolumeId {
        &self.file_volume.volume_id
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.branch_id)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.source_id)
    }
}

impl fmt::Display for SinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.sink_id)
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sink, self.opened_at)
    }
}

impl fmt::Display for FileVolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file, self.volume_id)
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_volume, self.opened_at)
    }
}

fn split_exact<'a>(s: &'a str, n: usize, what: &str) -> Result<Vec<&'a str>> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != n || parts.iter().any(|p| p.is_empty()) {
        return Err(CoreError::InvalidKey(format!(
            "{what} {s:?} must have {n} non-empty parts"
        )));
    }
    Ok(parts)
}

fn parse_u64(s: &str, what: &str) -> Result<u64> {
    s.parse()
        .map_err(|_| CoreError::InvalidKey(format!("{what} {s:?} is not a number")))
}

impl FromStr for BranchKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let p = split_exact(s, 2, "branch key")?;
        Ok(Self::new(
            parse_u64(p[0], "project id")?,
            parse_u64(p[1], "branch id")?,
        ))
    }
}

impl FromStr for SourceKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let p = split_exact(s, 3, "source key")?;
        SourceKey::new(p[..2].join("/").parse()?, p[2])
    }
}

impl FromStr for SinkKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let p = split_exact(s, 4, "sink key")?;
        SinkKey::new(p[..3].join("/").parse()?, p[3])
    }
}

impl FromStr for FileKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let p = split_exact(s, 5, "file key")?;
        Ok(FileKey::new(p[..4].join("/").parse()?, p[4].parse()?))
    }
}

impl FromStr for FileVolumeKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let p = split_exact(s, 6, "file volume key")?;
        let file: FileKey = p[..5].join("/").parse()?;
        Ok(file.volume(VolumeId::new(p[5])?))
    }
}

impl FromStr for SliceKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let p = split_exact(s, 7, "slice key")?;
        let file_volume: FileVolumeKey = p[..6].join("/").parse()?;
        Ok(file_volume.slice(p[6].parse()?))
    }
}

string_serde!(BranchKey);
string_serde!(SourceKey);
string_serde!(SinkKey);
string_serde!(FileKey);
string_serde!(FileVolumeKey);
string_serde!(SliceKey);
