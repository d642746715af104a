use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Once;
use tracing::warn;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Metadata Store Metrics
    // ============================================================================

    /// Commits of atomic operations rejected because a read key changed
    pub static ref ATOMIC_OP_CONFLICTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sinkhouse_atomic_op_conflicts_total", "Total atomic operation conflicts"),
        &["operation"]
    ).expect("metric can be created");

    /// Atomic operations that gave up after the last attempt
    pub static ref ATOMIC_OP_EXHAUSTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sinkhouse_atomic_op_exhausted_total", "Total atomic operations out of attempts"),
        &["operation"]
    ).expect("metric can be created");

    // ============================================================================
    // Storage Metrics
    // ============================================================================

    /// File rotations, `rotated` or `skipped` when the opened file changed
    pub static ref FILE_ROTATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sinkhouse_file_rotations_total", "Total file rotations"),
        &["result"]
    ).expect("metric can be created");

    /// Slice rotations, `rotated` or `skipped` when the opened slice changed
    pub static ref SLICE_ROTATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sinkhouse_slice_rotations_total", "Total slice rotations"),
        &["result"]
    ).expect("metric can be created");

    /// State transitions by entity and target state
    pub static ref STATE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sinkhouse_state_transitions_total", "Total state transitions"),
        &["entity", "state"]
    ).expect("metric can be created");

    /// Writes rejected by the buffer quota
    pub static ref QUOTA_REJECTIONS_TOTAL: IntCounter = IntCounter::new(
        "sinkhouse_quota_rejections_total",
        "Total writes rejected by the buffer quota"
    ).expect("metric can be created");

    /// Rows written to local slice files
    pub static ref SLICE_ROWS_TOTAL: IntCounter = IntCounter::new(
        "sinkhouse_slice_rows_total",
        "Total rows written to local slices"
    ).expect("metric can be created");

    /// Slice writers currently open
    pub static ref SLICE_WRITERS_OPEN: IntGauge = IntGauge::new(
        "sinkhouse_slice_writers_open",
        "Number of open slice writers"
    ).expect("metric can be created");

    /// Slice statistics synced from writers, `accepted` or `dropped`
    pub static ref STATISTICS_SYNC_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sinkhouse_statistics_sync_total", "Total slice statistics synced"),
        &["result"]
    ).expect("metric can be created");

    // ============================================================================
    // Worker Metrics
    // ============================================================================

    /// Duration of one checker tick
    pub static ref CHECKER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("sinkhouse_checker_duration_seconds", "Checker tick duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    ).expect("metric can be created");

    /// Actions taken by the checker
    pub static ref CHECKER_ACTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sinkhouse_checker_actions_total", "Total checker actions"),
        &["action"]
    ).expect("metric can be created");

    /// Failed checker operations, each one scheduled for a retry
    pub static ref CHECKER_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sinkhouse_checker_failures_total", "Total failed checker operations"),
        &["operation"]
    ).expect("metric can be created");

    /// Files deleted by the metadata cleanup
    pub static ref CLEANUP_DELETED_FILES_TOTAL: IntCounter = IntCounter::new(
        "sinkhouse_cleanup_deleted_files_total",
        "Total files deleted by the metadata cleanup"
    ).expect("metric can be created");

    /// Files the metadata cleanup failed to delete
    pub static ref CLEANUP_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "sinkhouse_cleanup_failures_total",
        "Total failed file deletions of the metadata cleanup"
    ).expect("metric can be created");

    /// Nodes in the distribution group, as seen by this node
    pub static ref DISTRIBUTION_NODES: IntGauge = IntGauge::new(
        "sinkhouse_distribution_nodes",
        "Number of nodes in the distribution group"
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        let collectors: Vec<(&str, Box<dyn prometheus::core::Collector>)> = vec![
            // Metadata store metrics
            ("atomic_op_conflicts_total", Box::new(ATOMIC_OP_CONFLICTS_TOTAL.clone())),
            ("atomic_op_exhausted_total", Box::new(ATOMIC_OP_EXHAUSTED_TOTAL.clone())),
            // Storage metrics
            ("file_rotations_total", Box::new(FILE_ROTATIONS_TOTAL.clone())),
            ("slice_rotations_total", Box::new(SLICE_ROTATIONS_TOTAL.clone())),
            ("state_transitions_total", Box::new(STATE_TRANSITIONS_TOTAL.clone())),
            ("quota_rejections_total", Box::new(QUOTA_REJECTIONS_TOTAL.clone())),
            ("slice_rows_total", Box::new(SLICE_ROWS_TOTAL.clone())),
            ("slice_writers_open", Box::new(SLICE_WRITERS_OPEN.clone())),
            ("statistics_sync_total", Box::new(STATISTICS_SYNC_TOTAL.clone())),
            // Worker metrics
            ("checker_duration", Box::new(CHECKER_DURATION.clone())),
            ("checker_actions_total", Box::new(CHECKER_ACTIONS_TOTAL.clone())),
            ("checker_failures_total", Box::new(CHECKER_FAILURES_TOTAL.clone())),
            ("cleanup_deleted_files_total", Box::new(CLEANUP_DELETED_FILES_TOTAL.clone())),
            ("cleanup_failures_total", Box::new(CLEANUP_FAILURES_TOTAL.clone())),
            ("distribution_nodes", Box::new(DISTRIBUTION_NODES.clone())),
        ];
        for (name, collector) in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!(metric = name, error = %e, "metric cannot be registered");
            }
        }
    });
}
