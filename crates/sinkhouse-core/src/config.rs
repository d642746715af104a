//! Pipeline configuration types
//!
//! Settings that travel with entities (a file remembers the compression and
//! sync policy it was opened with) or that can be overridden per sink.
//!
//! ## Overview
//!
//! - **CompressionConfig**: codec and level for local and staging data
//! - **SyncConfig**: when buffered writes are flushed/synced to disk
//! - **AllocConfig**: how much disk space is pre-allocated per slice
//! - **AssignmentConfig**: how many volumes a file spans, preferred volume types
//! - **Conditions**: count/size/time thresholds that trigger upload or import
//! - **SinkConfig**: all of the above as one per-sink bundle
//!
//! All structs implement `Default` and `validate()`. Durations serialize as
//! milliseconds.

use crate::error::{CoreError, Result};
use crate::size::ByteSize;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(rename = "type")]
    pub kind: CompressionType,
    /// Codec level, gzip 1-9, zstd 1-22.
    #[serde(default = "default_compression_level")]
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::gzip()
    }
}

impl CompressionConfig {
    pub fn none() -> Self {
        Self {
            kind: CompressionType::None,
            level: 0,
        }
    }

    pub fn gzip() -> Self {
        Self {
            kind: CompressionType::Gzip,
            level: default_compression_level(),
        }
    }

    pub fn zstd() -> Self {
        Self {
            kind: CompressionType::Zstd,
            level: 3,
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self.kind {
            CompressionType::None => "",
            CompressionType::Gzip => ".gz",
            CompressionType::Zstd => ".zst",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let range = match self.kind {
            CompressionType::None => return Ok(()),
            CompressionType::Gzip => 1..=9,
            CompressionType::Zstd => 1..=22,
        };
        if !range.contains(&self.level) {
            return Err(CoreError::InvalidConfig(format!(
                "compression level {} is out of range {:?}",
                self.level, range
            )));
        }
        Ok(())
    }
}

fn default_compression_level() -> u32 {
    6
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Data stays in process buffers until the slice is closed.
    Disabled,
    /// Buffers are synced all the way to the disk (fsync).
    Disk,
    /// Buffers are flushed to the OS disk cache.
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub mode: SyncMode,
    /// Writers wait for the next sync before acknowledging a write.
    #[serde(default)]
    pub wait: bool,
    #[serde(with = "duration_ms", default = "default_check_interval")]
    pub check_interval: Duration,
    #[serde(default = "default_count_trigger")]
    pub count_trigger: u64,
    #[serde(default = "default_bytes_trigger")]
    pub bytes_trigger: ByteSize,
    #[serde(with = "duration_ms", default = "default_interval_trigger")]
    pub interval_trigger: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Disk,
            wait: true,
            check_interval: default_check_interval(),
            count_trigger: default_count_trigger(),
            bytes_trigger: default_bytes_trigger(),
            interval_trigger: default_interval_trigger(),
        }
    }
}

impl SyncConfig {
    pub fn disabled() -> Self {
        Self {
            mode: SyncMode::Disabled,
            wait: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == SyncMode::Disabled {
            return Ok(());
        }
        if self.check_interval.is_zero() {
            return Err(CoreError::InvalidConfig("checkInterval is not set".into()));
        }
        if self.interval_trigger.is_zero() {
            return Err(CoreError::InvalidConfig("intervalTrigger is not set".into()));
        }
        if self.bytes_trigger == ByteSize::ZERO {
            return Err(CoreError::InvalidConfig("bytesTrigger is not set".into()));
        }
        if self.count_trigger == 0 {
            return Err(CoreError::InvalidConfig("countTrigger is not set".into()));
        }
        Ok(())
    }
}

fn default_check_interval() -> Duration {
    Duration::from_millis(5)
}

fn default_count_trigger() -> u64 {
    500
}

fn default_bytes_trigger() -> ByteSize {
    ByteSize::mb(1)
}

fn default_interval_trigger() -> Duration {
    Duration::from_millis(50)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Allocation used when there is no history of previous slices.
    #[serde(default = "default_static_size")]
    pub static_size: ByteSize,
    /// Allocation relative to the largest recent slice, in percent.
    #[serde(default = "default_size_percent")]
    pub size_percent: u64,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            static_size: default_static_size(),
            size_percent: default_size_percent(),
        }
    }
}

impl AllocConfig {
    /// Space to pre-allocate for the next slice, given the largest recent slice size.
    pub fn for_next_slice(&self, previous_max: Option<ByteSize>) -> ByteSize {
        if !self.enabled {
            return ByteSize::ZERO;
        }
        match previous_max {
            Some(size) if size > ByteSize::ZERO && self.size_percent > 0 => {
                size.percent(self.size_percent)
            }
            _ => self.static_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.static_size == ByteSize::ZERO {
            return Err(CoreError::InvalidConfig("static allocation size is not set".into()));
        }
        if self.size_percent > 500 {
            return Err(CoreError::InvalidConfig(format!(
                "allocation size percent {} is greater than 500",
                self.size_percent
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_static_size() -> ByteSize {
    ByteSize::mb(100)
}

fn default_size_percent() -> u64 {
    110
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// Number of volumes a new file is spread over.
    #[serde(default = "default_volumes_count")]
    pub count: usize,
    /// Volume types in order of preference.
    #[serde(default = "default_preferred_types")]
    pub preferred_types: Vec<String>,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            count: default_volumes_count(),
            preferred_types: default_preferred_types(),
        }
    }
}

impl AssignmentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(CoreError::InvalidConfig("volumes count must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_volumes_count() -> usize {
    1
}

fn default_preferred_types() -> Vec<String> {
    vec!["default".to_string()]
}

/// Thresholds that trigger an upload or an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    pub count: u64,
    pub size: ByteSize,
    #[serde(with = "duration_ms")]
    pub time: Duration,
}

impl Conditions {
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 || self.size == ByteSize::ZERO || self.time.is_zero() {
            return Err(CoreError::InvalidConfig(
                "count, size and time thresholds must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionsConfig {
    #[serde(default = "default_upload_conditions")]
    pub upload: Conditions,
    #[serde(default = "default_import_conditions")]
    pub import: Conditions,
    /// Minimal age of a slice/file before any condition may trigger.
    #[serde(with = "duration_ms", default = "default_min_interval")]
    pub min_interval: Duration,
}

impl Default for ConditionsConfig {
    fn default() -> Self {
        Self {
            upload: default_upload_conditions(),
            import: default_import_conditions(),
            min_interval: default_min_interval(),
        }
    }
}

impl ConditionsConfig {
    pub fn validate(&self) -> Result<()> {
        self.upload.validate()?;
        self.import.validate()
    }
}

fn default_upload_conditions() -> Conditions {
    Conditions {
        count: 10_000,
        size: ByteSize::mb(5),
        time: Duration::from_secs(60),
    }
}

fn default_import_conditions() -> Conditions {
    Conditions {
        count: 50_000,
        size: ByteSize::mb(50),
        time: Duration::from_secs(5 * 60),
    }
}

fn default_min_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub disk_sync: SyncConfig,
    #[serde(default)]
    pub disk_alloc: AllocConfig,
}

/// Per-sink settings, defaults overridden by the sink definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub local: LocalStorageConfig,
    #[serde(default)]
    pub staging_compression: CompressionConfig,
    #[serde(default)]
    pub assignment: AssignmentConfig,
    #[serde(default)]
    pub conditions: ConditionsConfig,
}

impl SinkConfig {
    pub fn validate(&self) -> Result<()> {
        self.local.compression.validate()?;
        self.local.disk_sync.validate()?;
        self.local.disk_alloc.validate()?;
        self.staging_compression.validate()?;
        self.assignment.validate()?;
        self.conditions.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SinkConfig::default().validate().unwrap();
    }

    #[test]
    fn test_sync_validation() {
        let mut cfg = SyncConfig::default();
        cfg.bytes_trigger = ByteSize::ZERO;
        assert_eq!(
            cfg.validate().unwrap_err().to_string(),
            "invalid config: bytesTrigger is not set"
        );

        let mut cfg = SyncConfig::disabled();
        cfg.bytes_trigger = ByteSize::ZERO;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_alloc_for_next_slice() {
        let cfg = AllocConfig::default();
        assert_eq!(cfg.for_next_slice(None), ByteSize::mb(100));
        assert_eq!(cfg.for_next_slice(Some(ByteSize::mb(10))), ByteSize::mb(11));

        let disabled = AllocConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(disabled.for_next_slice(Some(ByteSize::mb(10))), ByteSize::ZERO);
    }

    #[test]
    fn test_compression_level_range() {
        let mut cfg = CompressionConfig::zstd();
        cfg.level = 23;
        assert!(cfg.validate().is_err());
        cfg.level = 22;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: SinkConfig =
            serde_json::from_str(r#"{"assignment":{"count":2},"conditions":{"min_interval":1000}}"#)
                .unwrap();
        assert_eq!(cfg.assignment.count, 2);
        assert_eq!(cfg.assignment.preferred_types, vec!["default".to_string()]);
        assert_eq!(cfg.conditions.min_interval, Duration::from_secs(1));
        assert_eq!(cfg.conditions.upload.count, 10_000);
    }
}
