//! Disk volumes
//!
//! Writer nodes register the volumes they can write to. A new file is spread
//! over a deterministic subset of the registered volumes.

pub mod assignment;
pub mod registry;

pub use assignment::assign_volumes;
pub use registry::{VolumeInfo, VolumeRegistration, VolumeRegistry};
