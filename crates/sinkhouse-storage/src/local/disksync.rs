//! Disk synchronization of slice writers
//!
//! Written rows first land in process buffers (codec, `BufWriter`). The
//! [`Syncer`] pushes them further, to the OS disk cache (`cache` mode) or all
//! the way to the disk (`disk` mode), when one of the triggers fires:
//!
//! ```text
//!   write ──► count_trigger reached ─┐
//!   write ──► bytes_trigger reached ─┼──► sync ──► notifier.done(result)
//!   tick  ──► interval_trigger      ─┘
//! ```
//!
//! ## Waiting for sync
//!
//! With `wait = true` every write returns the [`Notifier`] of the sync that
//! will include it. The writer awaits it before acknowledging the row, so an
//! acknowledged row survives a crash (in `disk` mode).
//!
//! The notifier is swapped under the chain lock, at the start of each sync,
//! so a write can never get a notifier of a sync that does not cover it.

use crate::error::{Result, StorageError};
use sinkhouse_core::{SyncConfig, SyncMode};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Writers synchronized by the [`Syncer`].
pub trait SyncChain: Write + Send + 'static {
    /// Flushes process buffers to the OS disk cache.
    fn flush_to_cache(&mut self) -> io::Result<()>;

    /// Flushes process buffers and syncs the file to the disk.
    fn sync_to_disk(&mut self) -> io::Result<()>;
}

/// Completion of one sync.
pub struct Notifier {
    tx: watch::Sender<Option<std::result::Result<(), String>>>,
}

impl Notifier {
    fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(None);
        Arc::new(Self { tx })
    }

    fn done(&self, result: &io::Result<()>) {
        let value = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(e.to_string()),
        };
        self.tx.send_replace(Some(value));
    }

    /// Waits for the sync and returns its result.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result.map_err(|e| {
                    StorageError::Io(io::Error::new(io::ErrorKind::Other, format!("sync failed: {e}")))
                });
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

struct Inner<C> {
    config: SyncConfig,
    chain: Mutex<C>,
    bytes_to_sync: AtomicU64,
    writes_to_sync: AtomicU64,
    last_sync_at: Mutex<Instant>,
    notifier: Mutex<Arc<Notifier>>,
    // One sync at a time.
    sync_lock: tokio::sync::Mutex<()>,
    trigger: Notify,
}

impl<C: SyncChain> Inner<C> {
    fn chain(&self) -> MutexGuard<'_, C> {
        self.chain.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn triggered(&self) -> bool {
        self.writes_to_sync.load(Ordering::SeqCst) >= self.config.count_trigger
            || self.bytes_to_sync.load(Ordering::SeqCst) >= self.config.bytes_trigger.bytes()
    }

    fn interval_elapsed(&self) -> bool {
        let last = *self.last_sync_at.lock().unwrap_or_else(|e| e.into_inner());
        self.writes_to_sync.load(Ordering::SeqCst) > 0
            && last.elapsed() >= self.config.interval_trigger
    }

    async fn sync(self: &Arc<Self>) -> io::Result<()> {
        let _guard = self.sync_lock.lock().await;
        let inner = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut chain = inner.chain();
            let notifier = {
                let mut current = inner.notifier.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::replace(&mut *current, Notifier::new())
            };
            let writes = inner.writes_to_sync.swap(0, Ordering::SeqCst);
            let bytes = inner.bytes_to_sync.swap(0, Ordering::SeqCst);
            *inner.last_sync_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

            let result = match inner.config.mode {
                SyncMode::Disk => chain.sync_to_disk(),
                SyncMode::Cache => chain.flush_to_cache(),
                SyncMode::Disabled => Ok(()),
            };
            notifier.done(&result);
            debug!(writes, bytes, mode = ?inner.config.mode, "sync done");
            result
        })
        .await;
        match result {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

/// Writes to a chain and syncs it according to [`SyncConfig`].
pub struct Syncer<C> {
    inner: Arc<Inner<C>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<C: SyncChain> Syncer<C> {
    /// Wraps the chain and starts the sync loop, unless sync is disabled.
    pub fn start(config: SyncConfig, chain: C) -> Self {
        let inner = Arc::new(Inner {
            config,
            chain: Mutex::new(chain),
            bytes_to_sync: AtomicU64::new(0),
            writes_to_sync: AtomicU64::new(0),
            last_sync_at: Mutex::new(Instant::now()),
            notifier: Mutex::new(Notifier::new()),
            sync_lock: tokio::sync::Mutex::new(()),
            trigger: Notify::new(),
        });
        let cancel = CancellationToken::new();

        let task = if config.mode == SyncMode::Disabled {
            info!("sync is disabled");
            None
        } else {
            info!(
                mode = ?config.mode,
                count_trigger = config.count_trigger,
                bytes_trigger = %config.bytes_trigger,
                interval_trigger_ms = config.interval_trigger.as_millis() as u64,
                check_interval_ms = config.check_interval.as_millis() as u64,
                "sync is enabled"
            );
            Some(tokio::spawn(run(inner.clone(), cancel.clone())))
        };

        Self {
            inner,
            cancel,
            task,
        }
    }

    /// Writes one logical operation, e.g. one row.
    ///
    /// Returns the notifier of the sync covering the write, if writers should
    /// wait for it.
    pub fn write(&self, buf: &[u8]) -> Result<Option<Arc<Notifier>>> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Invalid("syncer is closed".into()));
        }
        let notifier = {
            let mut chain = self.inner.chain();
            chain.write_all(buf)?;
            self.inner.writes_to_sync.fetch_add(1, Ordering::SeqCst);
            self.inner
                .bytes_to_sync
                .fetch_add(buf.len() as u64, Ordering::SeqCst);
            let notifier = self.inner.notifier.lock().unwrap_or_else(|e| e.into_inner());
            notifier.clone()
        };

        if self.inner.config.mode == SyncMode::Disabled {
            return Ok(None);
        }
        if self.inner.triggered() {
            self.inner.trigger.notify_one();
        }
        Ok(self.inner.config.wait.then_some(notifier))
    }

    /// Syncs now and waits for the result.
    pub async fn sync(&self) -> Result<()> {
        Ok(self.inner.sync().await?)
    }

    /// Stops the loop, runs a final sync and returns the chain.
    pub async fn stop(mut self) -> Result<C> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "sync loop failed");
            }
        }
        self.inner.sync().await?;
        let inner = self.inner.clone();
        drop(self);
        let inner = Arc::try_unwrap(inner)
            .map_err(|_| StorageError::Invalid("syncer is still in use".into()))?;
        Ok(inner.chain.into_inner().unwrap_or_else(|e| e.into_inner()))
    }
}

impl<C> Drop for Syncer<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<C: SyncChain>(inner: Arc<Inner<C>>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = inner.trigger.notified() => {
                // A stale permit may outlive the sync that consumed the trigger.
                if !inner.triggered() {
                    continue;
                }
                if let Err(e) = inner.sync().await {
                    error!(error = %e, "sync failed");
                }
            }
            _ = ticker.tick() => {
                if inner.interval_elapsed() || inner.triggered() {
                    if let Err(e) = inner.sync().await {
                        error!(error = %e, "sync failed");
                    }
                }
            }
        }
    }
    debug!("sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default, Clone)]
    struct Recorder {
        data: Arc<Mutex<Vec<u8>>>,
        ops: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Recorder {
        fn ops(&self) -> Vec<&'static str> {
            self.ops.lock().unwrap().clone()
        }
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SyncChain for Recorder {
        fn flush_to_cache(&mut self) -> io::Result<()> {
            self.ops.lock().unwrap().push("flush");
            Ok(())
        }

        fn sync_to_disk(&mut self) -> io::Result<()> {
            self.ops.lock().unwrap().push("sync");
            Ok(())
        }
    }

    fn config(mode: SyncMode) -> SyncConfig {
        SyncConfig {
            mode,
            wait: true,
            check_interval: Duration::from_millis(10),
            count_trigger: 3,
            bytes_trigger: sinkhouse_core::ByteSize::mb(1),
            interval_trigger: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_count_trigger_notifies_writers() {
        let chain = Recorder::default();
        let syncer = Syncer::start(config(SyncMode::Disk), chain.clone());

        let n1 = syncer.write(b"a").unwrap().unwrap();
        let n2 = syncer.write(b"b").unwrap().unwrap();
        let n3 = syncer.write(b"c").unwrap().unwrap();
        n1.wait().await.unwrap();
        n2.wait().await.unwrap();
        n3.wait().await.unwrap();
        assert_eq!(chain.ops(), vec!["sync"]);

        let chain = syncer.stop().await.unwrap();
        assert_eq!(chain.data.lock().unwrap().as_slice(), b"abc");
    }

    #[tokio::test]
    async fn test_interval_trigger() {
        let chain = Recorder::default();
        let mut cfg = config(SyncMode::Cache);
        cfg.interval_trigger = Duration::from_millis(50);
        let syncer = Syncer::start(cfg, chain.clone());

        let notifier = syncer.write(b"row").unwrap().unwrap();
        notifier.wait().await.unwrap();
        assert_eq!(chain.ops(), vec!["flush"]);
        syncer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_and_no_wait() {
        let chain = Recorder::default();
        let syncer = Syncer::start(SyncConfig::disabled(), chain.clone());
        assert!(syncer.write(b"row").unwrap().is_none());
        syncer.stop().await.unwrap();
        assert!(chain.ops().is_empty());

        let mut cfg = config(SyncMode::Disk);
        cfg.wait = false;
        let syncer = Syncer::start(cfg, chain.clone());
        assert!(syncer.write(b"row").unwrap().is_none());
        // Final sync on stop.
        syncer.stop().await.unwrap();
        assert_eq!(chain.ops(), vec!["sync"]);
    }
}
