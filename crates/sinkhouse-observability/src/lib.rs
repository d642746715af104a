//! sinkhouse Observability
//!
//! Prometheus metrics of the storage pipeline. Metrics are global statics
//! registered once in [`REGISTRY`]; the layers update them directly:
//!
//! - **metadata**: atomic operation conflicts
//! - **storage**: rotations, state transitions, quota rejections, writers,
//!   statistics sync
//! - **agent**: checker ticks and actions, metadata cleanup, group size
//!
//! # Usage
//!
//! ```no_run
//! use sinkhouse_observability::{metrics, render};
//!
//! metrics::init();
//! metrics::QUOTA_REJECTIONS_TOTAL.inc();
//! let text = render().unwrap();
//! ```

pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

use prometheus::{Encoder, TextEncoder};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}

/// All registered metrics in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
