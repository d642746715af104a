//! Key layout in the metadata store
//!
//! ```text
//! definition/branch/<branch-key>
//! definition/source/<source-key>
//! definition/sink/<sink-key>
//! definition/token/<sink-key>
//!
//! storage/file/all/<file-key>                     canonical copy
//! storage/file/level/<level>/<file-key>           copy for per-level listing
//! storage/slice/all/<slice-key>
//! storage/slice/level/<level>/<slice-key>
//!
//! storage/stats/<level>/<slice-key>/value         per-slice counters
//! storage/stats/target/<sink-key>/_sum            roll-up of deleted files
//!
//! storage/volume/writer/<volume-id>               writable volumes (lease)
//! runtime/distribution/group/<group>/nodes/<id>   worker nodes (lease)
//! ```
//!
//! Files and slices are stored twice. Both copies are always written and
//! deleted in the same transaction.

use sinkhouse_core::{KeyPrefix, Level, SinkKey, SliceKey, VolumeId};
use std::fmt::Display;

/// Keys of an entity stored under `all` and under its current level.
#[derive(Debug, Clone, Copy)]
pub struct EntitySchema {
    name: &'static str,
}

pub const FILES: EntitySchema = EntitySchema { name: "file" };
pub const SLICES: EntitySchema = EntitySchema { name: "slice" };

impl EntitySchema {
    pub fn all_prefix(&self) -> String {
        format!("storage/{}/all/", self.name)
    }

    pub fn all(&self, key: &impl Display) -> String {
        format!("storage/{}/all/{}", self.name, key)
    }

    pub fn all_in(&self, parent: &impl KeyPrefix) -> String {
        format!("storage/{}/all/{}", self.name, parent.prefix())
    }

    pub fn level_prefix(&self, level: Level) -> String {
        format!("storage/{}/level/{}/", self.name, level)
    }

    pub fn in_level(&self, level: Level, key: &impl Display) -> String {
        format!("storage/{}/level/{}/{}", self.name, level, key)
    }

    pub fn in_level_in(&self, level: Level, parent: &impl KeyPrefix) -> String {
        format!("storage/{}/level/{}/{}", self.name, level, parent.prefix())
    }
}

pub mod stats {
    use super::*;

    pub const SUM_SUFFIX: &str = "/_sum";

    pub fn level_prefix(level: Level) -> String {
        format!("storage/stats/{}/", level)
    }

    pub fn value(level: Level, slice: &SliceKey) -> String {
        format!("storage/stats/{}/{}/value", level, slice)
    }

    pub fn in_level(level: Level, parent: &impl KeyPrefix) -> String {
        format!("storage/stats/{}/{}", level, parent.prefix())
    }

    /// Target statistics of deleted files, rolled up per sink.
    pub fn sum(sink: &SinkKey) -> String {
        format!("storage/stats/{}/{}{}", Level::Target, sink, SUM_SUFFIX)
    }

    /// Slice key of a per-slice value key, `None` for sums.
    pub fn parse_slice_key(key: &str) -> Option<SliceKey> {
        let rest = key.strip_prefix("storage/stats/")?;
        let (_level, rest) = rest.split_once('/')?;
        rest.strip_suffix("/value")?.parse().ok()
    }
}

pub mod definition {
    use super::*;

    pub fn branch(key: &impl Display) -> String {
        format!("definition/branch/{}", key)
    }

    pub fn source(key: &impl Display) -> String {
        format!("definition/source/{}", key)
    }

    pub fn sink(key: &impl Display) -> String {
        format!("definition/sink/{}", key)
    }

    pub fn sinks_prefix() -> &'static str {
        "definition/sink/"
    }

    pub fn sinks_in(parent: &impl KeyPrefix) -> String {
        format!("definition/sink/{}", parent.prefix())
    }

    pub fn token(sink: &SinkKey) -> String {
        format!("definition/token/{}", sink)
    }

    pub fn tokens_prefix() -> &'static str {
        "definition/token/"
    }
}

pub mod volume {
    use super::*;

    pub fn writers_prefix() -> &'static str {
        "storage/volume/writer/"
    }

    pub fn writer(id: &VolumeId) -> String {
        format!("storage/volume/writer/{}", id)
    }
}

pub mod distribution {
    pub fn nodes_prefix(group: &str) -> String {
        format!("runtime/distribution/group/{}/nodes/", group)
    }

    pub fn node(group: &str, node_id: &str) -> String {
        format!("runtime/distribution/group/{}/nodes/{}", group, node_id)
    }
}
