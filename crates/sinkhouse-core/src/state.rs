//! File and slice state machines
//!
//! ## States and Levels
//!
//! ```text
//! File:   Writing ──► Closing ──► Importing ──► Imported
//!         └──── Local ────┘       Staging       Target
//!
//! Slice:  Writing ──► Closing ──► Uploading ──► Uploaded ──► Imported
//!         └────────── Local ──────────┘         Staging      Target
//! ```
//!
//! The storage level of an entity is a pure function of its state.
//!
//! ## Valid Combinations
//!
//! | File state         | Allowed slice states                     |
//! |--------------------|------------------------------------------|
//! | Writing, Closing   | Writing, Closing, Uploading, Uploaded    |
//! | Importing          | Uploaded                                 |
//! | Imported           | Imported                                 |
//!
//! Every match below is exhaustive, so adding a state forces every table to
//! be revisited.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage tier holding the data of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Local disk of a worker node.
    Local,
    /// Staging object storage.
    Staging,
    /// Target table in the warehouse.
    Target,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Local, Level::Staging, Level::Target];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Local => "local",
            Level::Staging => "staging",
            Level::Target => "target",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Writing,
    Closing,
    Importing,
    Imported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceState {
    Writing,
    Closing,
    Uploading,
    Uploaded,
    Imported,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Writing => "writing",
            FileState::Closing => "closing",
            FileState::Importing => "importing",
            FileState::Imported => "imported",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            FileState::Writing | FileState::Closing => Level::Local,
            FileState::Importing => Level::Staging,
            FileState::Imported => Level::Target,
        }
    }

    pub fn can_transit_to(&self, to: FileState) -> bool {
        matches!(
            (self, to),
            (FileState::Writing, FileState::Closing)
                | (FileState::Closing, FileState::Importing)
                | (FileState::Importing, FileState::Imported)
        )
    }
}

impl SliceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceState::Writing => "writing",
            SliceState::Closing => "closing",
            SliceState::Uploading => "uploading",
            SliceState::Uploaded => "uploaded",
            SliceState::Imported => "imported",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            SliceState::Writing | SliceState::Closing | SliceState::Uploading => Level::Local,
            SliceState::Uploaded => Level::Staging,
            SliceState::Imported => Level::Target,
        }
    }

    pub fn can_transit_to(&self, to: SliceState) -> bool {
        matches!(
            (self, to),
            (SliceState::Writing, SliceState::Closing)
                | (SliceState::Closing, SliceState::Uploading)
                | (SliceState::Uploading, SliceState::Uploaded)
                | (SliceState::Uploaded, SliceState::Imported)
        )
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if a slice may be in `slice` state while its file is in `file` state.
pub fn is_valid_combination(file: FileState, slice: SliceState) -> bool {
    match file {
        FileState::Writing | FileState::Closing => matches!(
            slice,
            SliceState::Writing | SliceState::Closing | SliceState::Uploading | SliceState::Uploaded
        ),
        FileState::Importing => slice == SliceState::Uploaded,
        FileState::Imported => slice == SliceState::Imported,
    }
}

/// Validates the combination, naming the slice in the error.
pub fn validate_combination(slice_key: &str, file: FileState, slice: SliceState) -> Result<()> {
    if is_valid_combination(file, slice) {
        return Ok(());
    }
    Err(CoreError::InvalidCombination(format!(
        "unexpected slice \"{slice_key}\" state:\n- unexpected combination: file state \"{file}\" and slice state \"{slice}\""
    )))
}

/// Slice state a file transition drags its slices into, if any.
///
/// Closing a file closes its open slices; importing a file marks its
/// uploaded slices as imported.
pub fn cascade_slice_state(file_to: FileState, slice: SliceState) -> Option<SliceState> {
    match (file_to, slice) {
        (FileState::Closing, SliceState::Writing) => Some(SliceState::Closing),
        (FileState::Imported, SliceState::Uploaded) => Some(SliceState::Imported),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FILE_STATES: [FileState; 4] = [
        FileState::Writing,
        FileState::Closing,
        FileState::Importing,
        FileState::Imported,
    ];

    const SLICE_STATES: [SliceState; 5] = [
        SliceState::Writing,
        SliceState::Closing,
        SliceState::Uploading,
        SliceState::Uploaded,
        SliceState::Imported,
    ];

    #[test]
    fn test_levels() {
        assert_eq!(FileState::Writing.level(), Level::Local);
        assert_eq!(FileState::Closing.level(), Level::Local);
        assert_eq!(FileState::Importing.level(), Level::Staging);
        assert_eq!(FileState::Imported.level(), Level::Target);

        assert_eq!(SliceState::Uploading.level(), Level::Local);
        assert_eq!(SliceState::Uploaded.level(), Level::Staging);
        assert_eq!(SliceState::Imported.level(), Level::Target);
    }

    #[test]
    fn test_transitions_are_linear() {
        for (i, from) in FILE_STATES.iter().enumerate() {
            for (j, to) in FILE_STATES.iter().enumerate() {
                assert_eq!(from.can_transit_to(*to), j == i + 1, "{from} -> {to}");
            }
        }
        for (i, from) in SLICE_STATES.iter().enumerate() {
            for (j, to) in SLICE_STATES.iter().enumerate() {
                assert_eq!(from.can_transit_to(*to), j == i + 1, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_combination_error_message() {
        let err = validate_combination("my-slice", FileState::Importing, SliceState::Closing)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected slice \"my-slice\" state:\n- unexpected combination: file state \"importing\" and slice state \"closing\""
        );
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&SliceState::Uploaded).unwrap(),
            "\"uploaded\""
        );
        assert_eq!(serde_json::to_string(&Level::Staging).unwrap(), "\"staging\"");
    }

    fn any_file_state() -> impl Strategy<Value = FileState> {
        proptest::sample::select(FILE_STATES.to_vec())
    }

    fn any_slice_state() -> impl Strategy<Value = SliceState> {
        proptest::sample::select(SLICE_STATES.to_vec())
    }

    proptest! {
        // Cascades keep the table valid. Entering Importing has no cascade,
        // so slices that are not uploaded yet make that transition fail.
        #[test]
        fn cascade_keeps_valid_combinations(file_from in any_file_state(), slice in any_slice_state()) {
            prop_assume!(is_valid_combination(file_from, slice));
            for file_to in FILE_STATES.into_iter().filter(|to| file_from.can_transit_to(*to)) {
                let next = cascade_slice_state(file_to, slice).unwrap_or(slice);
                if file_to == FileState::Importing {
                    prop_assert_eq!(is_valid_combination(file_to, next), slice == SliceState::Uploaded);
                } else {
                    prop_assert!(is_valid_combination(file_to, next), "{} + {}", file_to, next);
                }
            }
        }

        // Levels never go backwards along an allowed edge.
        #[test]
        fn level_is_monotonic(from in any_slice_state(), to in any_slice_state()) {
            if from.can_transit_to(to) {
                prop_assert!(from.level() <= to.level());
            }
        }
    }
}
