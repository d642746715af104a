//! Disk space pre-allocation
//!
//! A slice file is extended to its expected size right after it is opened,
//! which keeps the blocks of a large steady slice together on disk. The
//! writer writes from the start of the file and truncates the unused tail
//! when the slice is closed.
//!
//! Allocation is best effort: a failure is logged and writing continues.

use sinkhouse_core::ByteSize;
use std::fs::File;
use std::io;
use tracing::{debug, warn};

pub trait Allocator: Send + Sync {
    /// Reserves `size` bytes for the file.
    fn allocate(&self, file: &File, size: ByteSize) -> io::Result<()>;
}

/// Extends the file with `set_len`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetLenAllocator;

impl Allocator for SetLenAllocator {
    fn allocate(&self, file: &File, size: ByteSize) -> io::Result<()> {
        file.set_len(size.bytes())
    }
}

/// Pre-allocates `size`, returns true if the space was reserved.
pub fn allocate(allocator: &dyn Allocator, file: &File, size: ByteSize) -> bool {
    if size == ByteSize::ZERO {
        return false;
    }
    match allocator.allocate(file, size) {
        Ok(()) => {
            debug!(size = %size, "disk space allocated");
            true
        }
        Err(e) => {
            warn!(size = %size, error = %e, "cannot allocate disk space");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingAllocator;

    impl Allocator for FailingAllocator {
        fn allocate(&self, _: &File, _: ByteSize) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "no space left"))
        }
    }

    #[test]
    fn test_allocate() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("slice.csv")).unwrap();

        assert!(allocate(&SetLenAllocator, &file, ByteSize::kb(10)));
        assert_eq!(file.metadata().unwrap().len(), ByteSize::kb(10).bytes());

        assert!(!allocate(&SetLenAllocator, &file, ByteSize::ZERO));
        assert!(!allocate(&FailingAllocator, &file, ByteSize::kb(10)));
    }
}
