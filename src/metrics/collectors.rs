//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`super::init_metrics`] has run, so library
//! users and tests that never initialise metrics pay nothing.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_CALLS, ACTIVE_RUNS, PROVIDER_CALLS_TOTAL, PROVIDER_LATENCY, PROVIDER_TOKENS_TOTAL,
    RATE_LIMIT_WAIT, RETRIES_TOTAL, RUNS_TOTAL, STAGE_UNITS_TOTAL,
};
use crate::llm::Usage;

/// Metrics collector for orchestrator operations.
///
/// # Example
///
/// ```ignore
/// use evalforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_provider_call("openai", "success", Duration::from_millis(820), None);
/// collector.record_stage_unit("single_eval", "completed");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn run_started(&self) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.inc();
        }
    }

    /// Records a run reaching a terminal status.
    pub fn run_finished(&self, status: &str) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.dec();
        }
        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&[status]).inc();
        }
        tracing::trace!(status = status, "Recorded run metric");
    }

    /// Records one finished unit of stage work (a task, an eval round, a
    /// comparison, a combine call).
    pub fn record_stage_unit(&self, stage: &str, status: &str) {
        if let Some(units) = STAGE_UNITS_TOTAL.get() {
            units.with_label_values(&[stage, status]).inc();
        }
    }

    /// Records one provider call attempt.
    ///
    /// # Arguments
    ///
    /// * `provider` - provider prefix of the model id
    /// * `outcome` - `success`, or the failure kind
    /// * `latency` - wall time of the attempt
    /// * `usage` - token usage, when the provider reported it
    pub fn record_provider_call(
        &self,
        provider: &str,
        outcome: &str,
        latency: Duration,
        usage: Option<Usage>,
    ) {
        if let Some(calls) = PROVIDER_CALLS_TOTAL.get() {
            calls.with_label_values(&[provider, outcome]).inc();
        }

        if let Some(hist) = PROVIDER_LATENCY.get() {
            hist.with_label_values(&[provider])
                .observe(latency.as_secs_f64());
        }

        if let (Some(tokens), Some(usage)) = (PROVIDER_TOKENS_TOTAL.get(), usage) {
            tokens
                .with_label_values(&[provider, "input"])
                .inc_by(usage.prompt_tokens as f64);
            tokens
                .with_label_values(&[provider, "output"])
                .inc_by(usage.completion_tokens as f64);
        }

        tracing::trace!(
            provider = provider,
            outcome = outcome,
            latency_ms = latency.as_millis() as u64,
            "Recorded provider call metric"
        );
    }

    pub fn record_retry(&self, reason: &str) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.with_label_values(&[reason]).inc();
        }
    }

    pub fn record_rate_limit_wait(&self, provider: &str, waited: Duration) {
        if let Some(hist) = RATE_LIMIT_WAIT.get() {
            hist.with_label_values(&[provider])
                .observe(waited.as_secs_f64());
        }
    }

    pub fn call_started(&self) {
        if let Some(active) = ACTIVE_CALLS.get() {
            active.inc();
        }
    }

    pub fn call_finished(&self) {
        if let Some(active) = ACTIVE_CALLS.get() {
            active.dec();
        }
    }
}
