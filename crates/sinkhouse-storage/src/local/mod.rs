//! Local storage of slices
//!
//! Everything between a written row and a slice file on a local volume:
//!
//! - [`writer`]: CSV encoding of rows into the slice file
//! - [`compression`]: gzip / zstd codecs
//! - [`disksync`]: flush and fsync triggers, writers waiting for a sync
//! - [`diskalloc`]: best effort pre-allocation of the slice file
//! - [`pool`]: open writers of the node, quota and statistics sync

pub mod compression;
pub mod diskalloc;
pub mod disksync;
pub mod pool;
pub mod writer;

pub use compression::{Decoder, Encoder};
pub use diskalloc::{Allocator, SetLenAllocator};
pub use disksync::{Notifier, SyncChain, Syncer};
pub use pool::WriterPool;
pub use writer::SliceWriter;
