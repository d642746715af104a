//! Slice writer
//!
//! Writes CSV rows of one slice to its file on a local volume:
//!
//! ```text
//!   row ──► csv::Writer ──► Syncer ──► codec ──► BufWriter ──► counter ──► file
//!                              │                                  │
//!                              └── sync triggers                  └── compressed size
//! ```
//!
//! The file is pre-allocated when opened and truncated to the written size
//! when closed. Statistics of the slice are tracked as rows are written and
//! reported with [`SliceWriter::stats`].

use super::compression::Encoder;
use super::diskalloc::{self, Allocator};
use super::disksync::{SyncChain, Syncer};
use crate::error::{Result, StorageError};
use sinkhouse_core::{ByteSize, Slice, SliceKey, UtcTime, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Counts bytes reaching the file.
struct Counting {
    file: File,
    written: Arc<AtomicU64>,
}

impl Write for Counting {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

struct SliceChain {
    encoder: Encoder<BufWriter<Counting>>,
}

impl Write for SliceChain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl SyncChain for SliceChain {
    fn flush_to_cache(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }

    fn sync_to_disk(&mut self) -> io::Result<()> {
        self.encoder.flush()?;
        self.encoder.get_mut().get_ref().file.sync_data()
    }
}

pub struct SliceWriter {
    key: SliceKey,
    path: PathBuf,
    columns: usize,
    syncer: Syncer<SliceChain>,
    written: Arc<AtomicU64>,
    allocated: bool,
    stats: Mutex<Stats>,
}

#[derive(Default)]
struct Stats {
    value: Value,
    // Compressed bytes already accounted in `value`.
    accounted: u64,
}

impl SliceWriter {
    /// Opens the slice file under `volume_path` and pre-allocates it.
    ///
    /// Must be called inside a tokio runtime, the disk sync runs as a task.
    pub fn open(volume_path: &Path, slice: &Slice, allocator: &dyn Allocator) -> Result<Self> {
        let dir = volume_path.join(&slice.local_storage.dir);
        fs::create_dir_all(&dir)?;
        let path = dir.join(&slice.local_storage.filename);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => {
                    StorageError::already_exists("slice file", path.display())
                }
                _ => StorageError::Io(e),
            })?;

        let allocated = diskalloc::allocate(
            allocator,
            &file,
            slice.local_storage.allocated_disk_space,
        );

        let written = Arc::new(AtomicU64::new(0));
        let counting = Counting {
            file,
            written: written.clone(),
        };
        let encoder = Encoder::new(
            &slice.local_storage.compression,
            BufWriter::with_capacity(WRITE_BUFFER_SIZE, counting),
        )?;
        let syncer = Syncer::start(slice.local_storage.disk_sync, SliceChain { encoder });

        info!(slice = %slice.key, path = %path.display(), "slice writer opened");
        Ok(Self {
            key: slice.key.clone(),
            path,
            columns: slice.columns.len(),
            syncer,
            written,
            allocated,
            stats: Mutex::new(Stats::default()),
        })
    }

    pub fn key(&self) -> &SliceKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one row, waits for its sync if the slice is configured to.
    pub async fn write_row(&self, now: UtcTime, values: &[String]) -> Result<()> {
        if values.len() != self.columns {
            return Err(StorageError::BadRequest(format!(
                "expected {} columns in the row, given {}",
                self.columns,
                values.len()
            )));
        }
        let row = encode_row(values)?;
        let notifier = self.syncer.write(&row)?;
        self.record(now, row.len() as u64);
        if let Some(notifier) = notifier {
            notifier.wait().await?;
        }
        Ok(())
    }

    fn record(&self, now: UtcTime, uncompressed: u64) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let written = self.written.load(Ordering::SeqCst);
        let compressed = written.saturating_sub(stats.accounted);
        stats.accounted = written;
        stats
            .value
            .record(now, 1, ByteSize(uncompressed), ByteSize(compressed));
    }

    /// Statistics of the rows written so far.
    pub fn stats(&self) -> Value {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .value
            .clone()
    }

    /// Flushes everything, finishes the codec stream and releases unused space.
    pub async fn close(self) -> Result<Value> {
        let chain = self.syncer.stop().await?;
        let buffered = chain.encoder.finish()?;
        let counting = buffered
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?;
        let size = self.written.load(Ordering::SeqCst);
        if self.allocated {
            counting.file.set_len(size)?;
        }
        counting.file.sync_all()?;

        let mut stats = self.stats.into_inner().unwrap_or_else(|e| e.into_inner());
        stats.value.compressed_size = ByteSize(size);
        debug!(slice = %self.key, size, records = stats.value.records_count, "slice writer closed");
        Ok(stats.value)
    }
}

/// Encodes one CSV row, quoting fields where needed.
fn encode_row(values: &[String]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::with_capacity(128));
    writer.write_record(values).map_err(io::Error::from)?;
    writer.into_inner().map_err(|e| StorageError::Io(e.into_error()))
}
