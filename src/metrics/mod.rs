//! Prometheus-based monitoring for runs, stages and provider calls.
//!
//! # Example
//!
//! ```ignore
//! use evalforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_stage_unit("generation", "completed");
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_CALLS, ACTIVE_RUNS, PROVIDER_CALLS_TOTAL, PROVIDER_LATENCY, PROVIDER_TOKENS_TOTAL,
    RATE_LIMIT_WAIT, REGISTRY, RETRIES_TOTAL, RUNS_TOTAL, STAGE_UNITS_TOTAL,
};
