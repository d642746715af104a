//! Checker - Periodic Rotation, Upload and Import
//!
//! The checker moves the files and slices of the sinks this node owns
//! through their lifecycle. It runs on every worker node and only handles
//! sinks the node owns in the distribution ring.
//!
//! ## Mirrors
//!
//! The checker never scans the store to find work. It keeps in-memory
//! mirrors of the owned:
//!
//! - sinks (conditions come with the sink config)
//! - tokens (a sink without a token is not rotated)
//! - files not imported yet
//! - slices not uploaded yet
//!
//! Ownership is evaluated by the mirror filters, so all mirrors are rebuilt
//! when the distribution changes. Each tick works on one snapshot of the
//! mirrors.
//!
//! ## Tick
//!
//! ```text
//!   Writing slice    credentials expire soon     → rotate the file
//!                    import conditions of file   → rotate the file
//!                    upload conditions of slice  → rotate the slice
//!   Closing slice    close the local writer, → Uploading
//!   Uploading slice  upload unless empty, → Uploaded
//!   Closing file     all slices uploaded, → Importing
//!   Importing file   import unless empty, → Imported
//! ```
//!
//! Rotations are guarded by the evaluated key: a file or slice that is no
//! longer the opened one is left alone.
//!
//! ## Processed entities
//!
//! A mirror receives the result of an operation some time after it was
//! committed. Entities changed by a tick are remembered with the state and
//! retry attempt they had, and skipped until the mirror shows a different
//! version. A failed operation schedules a retry; the entity is skipped
//! until its `retry_after`.

use crate::conditions::{evaluate, guard_min_interval};
use crate::config::CheckerConfig;
use crate::distribution::DistributionNode;
use crate::error::Result;
use sinkhouse_core::{
    File, FileKey, FileState, HasExpiration, Retryable, Slice, SliceKey, SliceState, UtcTime,
};
use sinkhouse_metadata::{json_mapper, KvStore, Mirror};
use sinkhouse_observability::metrics;
use sinkhouse_storage::schema::{definition as definition_keys, FILES, SLICES};
use sinkhouse_storage::{
    ErrorKind, FileImporter, Repository, Sink, SliceUploader, StorageError, Token, WriterPool,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Action taken by one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RotateFile { file: FileKey, reason: String },
    RotateSlice { slice: SliceKey, reason: String },
    UploadSlice { slice: SliceKey },
    CloseFile { file: FileKey },
    ImportFile { file: FileKey },
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::RotateFile { .. } => "rotate_file",
            Action::RotateSlice { .. } => "rotate_slice",
            Action::UploadSlice { .. } => "upload_slice",
            Action::CloseFile { .. } => "close_file",
            Action::ImportFile { .. } => "import_file",
        }
    }
}

/// Summary of one check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Opened slices evaluated against their conditions.
    pub checked: usize,
    pub actions: Vec<Action>,
    /// Operations that failed and were scheduled for a retry.
    pub failed: usize,
}

impl CheckReport {
    fn push(&mut self, action: Action) {
        metrics::CHECKER_ACTIONS_TOTAL
            .with_label_values(&[action.name()])
            .inc();
        self.actions.push(action);
    }
}

/// Where closed slices and files go.
#[derive(Clone)]
pub struct CheckerServices {
    pub uploader: Arc<dyn SliceUploader>,
    pub importer: Arc<dyn FileImporter>,
    /// Open writers of this node, closed before their slice is uploaded.
    pub writers: Option<Arc<WriterPool>>,
}

/// State and retry attempt of an entity version.
type Version = (String, u32);

fn slice_version(slice: &Slice) -> Version {
    (slice.state.to_string(), slice.retry.retry_attempt)
}

fn file_version(file: &File) -> Version {
    (file.state.to_string(), file.retry.retry_attempt)
}

struct Inner {
    repo: Repository,
    services: CheckerServices,
    config: CheckerConfig,
    sinks: Mirror<Sink>,
    tokens: Mirror<Token>,
    files: Mirror<File>,
    slices: Mirror<Slice>,
    // Raw key → versions already acted on.
    processed: std::sync::Mutex<HashMap<String, Vec<Version>>>,
    check_lock: Mutex<()>,
}

pub struct Checker {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Checker {
    /// Loads the mirrors and starts the periodic check.
    pub async fn start(
        store: Arc<dyn KvStore>,
        repo: Repository,
        dist: Arc<DistributionNode>,
        services: CheckerServices,
        config: CheckerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let started = Instant::now();

        let d = dist.clone();
        let sinks = Mirror::start(
            store.clone(),
            definition_keys::sinks_prefix(),
            json_mapper(move |sink: &Sink| d.is_owner(&sink.key.to_string())),
        )
        .await?;

        let d = dist.clone();
        let tokens = Mirror::start(
            store.clone(),
            definition_keys::tokens_prefix(),
            json_mapper(move |token: &Token| d.is_owner(&token.sink_key.to_string())),
        )
        .await?;

        let d = dist.clone();
        let files = Mirror::start(
            store.clone(),
            FILES.all_prefix(),
            json_mapper(move |file: &File| {
                file.state != FileState::Imported && d.is_owner(&file.key.sink().to_string())
            }),
        )
        .await?;

        let d = dist.clone();
        let slices = Mirror::start(
            store,
            SLICES.all_prefix(),
            json_mapper(move |slice: &Slice| {
                matches!(
                    slice.state,
                    SliceState::Writing | SliceState::Closing | SliceState::Uploading
                ) && d.is_owner(&slice.key.sink().to_string())
            }),
        )
        .await?;

        let inner = Arc::new(Inner {
            repo,
            services,
            config,
            sinks,
            tokens,
            files,
            slices,
            processed: std::sync::Mutex::new(HashMap::new()),
            check_lock: Mutex::new(()),
        });
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(inner.clone().run_ticker(cancel.clone())),
            tokio::spawn(inner.clone().run_restarts(dist, cancel.clone())),
        ];

        info!(
            sinks = inner.sinks.len(),
            files = inner.files.len(),
            slices = inner.slices.len(),
            interval_secs = config.interval.as_secs(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checker initialized"
        );
        Ok(Self {
            inner,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Runs one check at `now`.
    pub async fn check(&self, now: UtcTime) -> CheckReport {
        self.inner.check(now).await
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "checker task failed");
            }
        }
        info!("checker stopped");
    }
}

impl Drop for Checker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    async fn run_ticker(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check(UtcTime::now()).await;
                }
            }
        }
    }

    async fn run_restarts(
        self: Arc<Self>,
        dist: Arc<DistributionNode>,
        cancel: CancellationToken,
    ) {
        let mut changes = dist.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    info!("distribution changed, restarting mirrors");
                    self.sinks.restart();
                    self.tokens.restart();
                    self.files.restart();
                    self.slices.restart();
                }
            }
        }
    }

    async fn check(&self, now: UtcTime) -> CheckReport {
        let _guard = self.check_lock.lock().await;
        let started = Instant::now();
        let mut report = CheckReport::default();

        let files: BTreeMap<FileKey, File> = self
            .files
            .values()
            .into_iter()
            .map(|f| (f.key.clone(), f))
            .collect();
        let slices = self.slices.values();
        self.forget_delivered(&files, &slices);

        let mut rotated: HashSet<FileKey> = HashSet::new();
        for slice in slices.iter().filter(|s| s.state == SliceState::Writing) {
            self.check_opened_slice(now, slice, &files, &mut rotated, &mut report)
                .await;
        }
        for slice in slices
            .iter()
            .filter(|s| matches!(s.state, SliceState::Closing | SliceState::Uploading))
        {
            if self.should_check(&SLICES.all(&slice.key), slice_version(slice), &slice.retry, now) {
                self.upload_slice(now, slice, &mut report).await;
            }
        }
        for file in files.values() {
            if !matches!(file.state, FileState::Closing | FileState::Importing) {
                continue;
            }
            if self.should_check(&FILES.all(&file.key), file_version(file), &file.retry, now) {
                self.import_file(now, file, &mut report).await;
            }
        }

        metrics::CHECKER_DURATION.observe(started.elapsed().as_secs_f64());
        debug!(
            checked = report.checked,
            actions = report.actions.len(),
            failed = report.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checked files and slices"
        );
        report
    }

    /// Drops processed entries the mirrors have caught up with.
    fn forget_delivered(&self, files: &BTreeMap<FileKey, File>, slices: &[Slice]) {
        let mut current: HashMap<String, Version> = HashMap::new();
        for file in files.values() {
            current.insert(FILES.all(&file.key), file_version(file));
        }
        for slice in slices {
            current.insert(SLICES.all(&slice.key), slice_version(slice));
        }
        self.processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|key, versions| {
                current
                    .get(key)
                    .is_some_and(|version| versions.contains(version))
            });
    }

    fn is_processed(&self, key: &str, version: &Version) -> bool {
        self.processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .is_some_and(|versions| versions.contains(version))
    }

    fn mark_processed(&self, key: String, versions: Vec<Version>) {
        self.processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .extend(versions);
    }

    fn should_check(&self, key: &str, version: Version, retry: &Retryable, now: UtcTime) -> bool {
        if self.is_processed(key, &version) {
            return false;
        }
        if retry.is_waiting(now) {
            debug!(key, retry_after = ?retry.retry_after, "skipped, waiting for retry");
            return false;
        }
        true
    }

    async fn check_opened_slice(
        &self,
        now: UtcTime,
        slice: &Slice,
        files: &BTreeMap<FileKey, File>,
        rotated: &mut HashSet<FileKey>,
        report: &mut CheckReport,
    ) {
        if !self.should_check(&SLICES.all(&slice.key), slice_version(slice), &slice.retry, now) {
            return;
        }
        let file_key = slice.key.file();
        let sink_key = slice.key.sink();
        if rotated.contains(file_key) {
            return;
        }
        // The mirror may not have delivered the rotation of the file yet.
        let Some(file) = files.get(file_key).filter(|f| f.state == FileState::Writing) else {
            debug!(slice = %slice.key, "skipped slice, its file is not opened");
            return;
        };
        if !self.should_check(&FILES.all(file_key), file_version(file), &file.retry, now) {
            return;
        }
        if self.tokens.get(&definition_keys::token(sink_key)).is_none() {
            debug!(sink = %sink_key, "skipped sink without token");
            return;
        }
        let Some(sink) = self.sinks.get(&definition_keys::sink(sink_key)) else {
            return;
        };
        report.checked += 1;
        let conditions = sink.config.conditions;

        // Credentials
        let expiration = file.staging_storage.credentials.expiration();
        if expiration <= now.plus(self.config.min_credentials_expiration) {
            let reason = format!("upload credentials will expire soon, at {expiration}");
            self.rotate_file(now, file, &reason, report).await;
            rotated.insert(file_key.clone());
            return;
        }

        // Import
        match self.repo.statistics.file_stats(file_key).await {
            Ok(stats) => {
                let e = evaluate(&conditions.import, now, file_key.opened_at, &stats.total);
                let e = guard_min_interval(e, conditions.min_interval, now, file_key.opened_at);
                if e.met {
                    self.rotate_file(now, file, &e.reason, report).await;
                    rotated.insert(file_key.clone());
                    return;
                }
                debug!(file = %file_key, reason = %e.reason, "skipped import of the file");
            }
            Err(e) => {
                error!(file = %file_key, error = %e, "cannot load file statistics");
                return;
            }
        }

        // Upload
        match self.repo.statistics.slice_stats(&slice.key).await {
            Ok(stats) => {
                let opened_at = slice.key.opened_at;
                let e = evaluate(&conditions.upload, now, opened_at, &stats.total);
                let e = guard_min_interval(e, conditions.min_interval, now, opened_at);
                if e.met {
                    self.rotate_slice(now, slice, &e.reason, report).await;
                } else {
                    debug!(slice = %slice.key, reason = %e.reason, "skipped upload of the slice");
                }
            }
            Err(e) => error!(slice = %slice.key, error = %e, "cannot load slice statistics"),
        }
    }

    async fn rotate_file(&self, now: UtcTime, file: &File, reason: &str, report: &mut CheckReport) {
        info!(file = %file.key, reason = %reason, "rotating file");
        match self.repo.files.rotate_opened(now, &file.key).await {
            Ok(Some(opened)) => {
                debug!(file = %opened.key, "file opened");
                report.push(Action::RotateFile {
                    file: file.key.clone(),
                    reason: reason.to_string(),
                });
            }
            Ok(None) => debug!(file = %file.key, "skipped file rotation, the file is no longer opened"),
            Err(e) => {
                self.file_failed(now, file, "rotate", e, vec![file_version(file)], report)
                    .await;
                return;
            }
        }
        self.mark_processed(FILES.all(&file.key), vec![file_version(file)]);
    }

    async fn rotate_slice(&self, now: UtcTime, slice: &Slice, reason: &str, report: &mut CheckReport) {
        info!(slice = %slice.key, reason = %reason, "rotating slice");
        match self.repo.slices.rotate_opened(now, &slice.key).await {
            Ok(Some(_)) => report.push(Action::RotateSlice {
                slice: slice.key.clone(),
                reason: reason.to_string(),
            }),
            Ok(None) => debug!(slice = %slice.key, "skipped slice rotation, the slice is no longer opened"),
            Err(e) => {
                self.slice_failed(now, slice, "rotate", e, vec![slice_version(slice)], report)
                    .await;
                return;
            }
        }
        self.mark_processed(SLICES.all(&slice.key), vec![slice_version(slice)]);
    }

    /// Closes the slice if needed, uploads it and marks it uploaded.
    async fn upload_slice(&self, now: UtcTime, seen: &Slice, report: &mut CheckReport) {
        let key = &seen.key;
        let Some(mut slice) = self.current_slice(seen).await else {
            return;
        };
        let mut versions = vec![slice_version(seen)];

        if slice.state == SliceState::Closing {
            if let Some(writers) = &self.services.writers {
                if writers.contains(key).await {
                    if let Err(e) = writers.close(key).await {
                        self.slice_failed(now, &slice, "close", e, versions, report).await;
                        return;
                    }
                }
            }
            match self
                .repo
                .slices
                .state_transition(now, key, SliceState::Closing, SliceState::Uploading)
                .await
            {
                Ok(updated) => {
                    versions.push(slice_version(&updated));
                    slice = updated;
                }
                Err(e) => {
                    self.slice_failed(now, &slice, "close", e, versions, report).await;
                    return;
                }
            }
        }

        if let Err(e) = self.upload(&slice).await {
            self.slice_failed(now, &slice, "upload", e, versions, report).await;
            return;
        }
        match self
            .repo
            .slices
            .state_transition(now, key, SliceState::Uploading, SliceState::Uploaded)
            .await
        {
            Ok(_) => {
                report.push(Action::UploadSlice { slice: key.clone() });
                self.mark_processed(SLICES.all(key), versions);
            }
            Err(e) => self.slice_failed(now, &slice, "upload", e, versions, report).await,
        }
    }

    async fn upload(&self, slice: &Slice) -> sinkhouse_storage::Result<()> {
        let stats = self.repo.statistics.slice_stats(&slice.key).await?;
        if stats.total.records_count == 0 {
            debug!(slice = %slice.key, "skipped upload of an empty slice");
            return Ok(());
        }
        let file = self.repo.files.get(slice.key.file()).await?;
        self.services.uploader.upload(slice, &file).await
    }

    /// Waits for the slices, imports the file and marks it imported.
    async fn import_file(&self, now: UtcTime, seen: &File, report: &mut CheckReport) {
        let key = &seen.key;
        let Some(mut file) = self.current_file(seen).await else {
            return;
        };
        let mut versions = vec![file_version(seen)];
        let slices = match self.repo.slices.list_in(key).await {
            Ok(slices) => slices,
            Err(e) => {
                error!(file = %key, error = %e, "cannot load slices of the file");
                return;
            }
        };

        if file.state == FileState::Closing {
            let pending = slices
                .iter()
                .filter(|s| s.state != SliceState::Uploaded)
                .count();
            if pending > 0 {
                debug!(file = %key, pending, "waiting for slices upload");
                return;
            }
            match self
                .repo
                .files
                .state_transition(now, key, FileState::Closing, FileState::Importing)
                .await
            {
                Ok(updated) => {
                    report.push(Action::CloseFile { file: key.clone() });
                    versions.push(file_version(&updated));
                    file = updated;
                }
                Err(e) => {
                    self.file_failed(now, &file, "close", e, versions, report).await;
                    return;
                }
            }
        }

        if let Err(e) = self.import(&file, &slices).await {
            self.file_failed(now, &file, "import", e, versions, report).await;
            return;
        }
        match self
            .repo
            .files
            .state_transition(now, key, FileState::Importing, FileState::Imported)
            .await
        {
            Ok(_) => {
                report.push(Action::ImportFile { file: key.clone() });
                self.mark_processed(FILES.all(key), versions);
            }
            Err(e) => self.file_failed(now, &file, "import", e, versions, report).await,
        }
    }

    async fn import(&self, file: &File, slices: &[Slice]) -> sinkhouse_storage::Result<()> {
        let stats = self.repo.statistics.file_stats(&file.key).await?;
        if stats.total.records_count == 0 {
            debug!(file = %file.key, "skipped import of an empty file");
            return Ok(());
        }
        self.services.importer.import(file, slices).await
    }

    /// The stored slice, if the mirror version is still current.
    async fn current_slice(&self, seen: &Slice) -> Option<Slice> {
        match self.repo.slices.get(&seen.key).await {
            Ok(slice) if slice_version(&slice) == slice_version(seen) => Some(slice),
            Ok(_) => {
                self.mark_processed(SLICES.all(&seen.key), vec![slice_version(seen)]);
                None
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                error!(slice = %seen.key, error = %e, "cannot load slice");
                None
            }
        }
    }

    /// The stored file, if the mirror version is still current.
    async fn current_file(&self, seen: &File) -> Option<File> {
        match self.repo.files.get(&seen.key).await {
            Ok(file) if file_version(&file) == file_version(seen) => Some(file),
            Ok(_) => {
                self.mark_processed(FILES.all(&seen.key), vec![file_version(seen)]);
                None
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                error!(file = %seen.key, error = %e, "cannot load file");
                None
            }
        }
    }

    async fn slice_failed(
        &self,
        now: UtcTime,
        slice: &Slice,
        operation: &'static str,
        err: StorageError,
        versions: Vec<Version>,
        report: &mut CheckReport,
    ) {
        report.failed += 1;
        metrics::CHECKER_FAILURES_TOTAL
            .with_label_values(&[operation])
            .inc();
        error!(slice = %slice.key, operation, error = %err, "slice operation failed");
        let reason = format!("cannot {operation} slice: {err}");
        match self.repo.slices.increment_retry(now, &slice.key, &reason).await {
            // The retried version stays unmarked, `retry_after` gates it.
            Ok(_) => self.mark_processed(SLICES.all(&slice.key), versions),
            Err(e) => error!(slice = %slice.key, error = %e, "cannot increment slice retry"),
        }
    }

    async fn file_failed(
        &self,
        now: UtcTime,
        file: &File,
        operation: &'static str,
        err: StorageError,
        versions: Vec<Version>,
        report: &mut CheckReport,
    ) {
        report.failed += 1;
        metrics::CHECKER_FAILURES_TOTAL
            .with_label_values(&[operation])
            .inc();
        error!(file = %file.key, operation, error = %err, "file operation failed");
        let reason = format!("cannot {operation} file: {err}");
        match self.repo.files.increment_retry(now, &file.key, &reason).await {
            // The retried version stays unmarked, `retry_after` gates it.
            Ok(_) => self.mark_processed(FILES.all(&file.key), versions),
            Err(e) => error!(file = %file.key, error = %e, "cannot increment file retry"),
        }
    }
}
