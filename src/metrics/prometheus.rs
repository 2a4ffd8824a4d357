//! Prometheus metrics registration and export.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all evalforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Runs reaching a terminal state, labeled by status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Runs currently executing.
pub static ACTIVE_RUNS: OnceLock<Gauge> = OnceLock::new();

/// Finished units of stage work, labeled by stage and status.
pub static STAGE_UNITS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Provider call attempts, labeled by provider and outcome.
pub static PROVIDER_CALLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Provider call latency in seconds, labeled by provider.
pub static PROVIDER_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Tokens reported by providers, labeled by provider and type (input/output).
pub static PROVIDER_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Retries scheduled, labeled by failure kind.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent blocked on the rate limiter, labeled by provider.
pub static RATE_LIMIT_WAIT: OnceLock<HistogramVec> = OnceLock::new();

/// Provider calls currently in flight across all runs.
pub static ACTIVE_CALLS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric construction or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("evalforge_runs_total", "Runs reaching a terminal state"),
        &["status"],
    )?;

    let active_runs = Gauge::new("evalforge_active_runs", "Runs currently executing")?;

    let stage_units_total = CounterVec::new(
        Opts::new("evalforge_stage_units_total", "Finished units of stage work"),
        &["stage", "status"],
    )?;

    let provider_calls_total = CounterVec::new(
        Opts::new("evalforge_provider_calls_total", "Provider call attempts"),
        &["provider", "outcome"],
    )?;

    let provider_latency = HistogramVec::new(
        HistogramOpts::new(
            "evalforge_provider_latency_seconds",
            "Provider call latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["provider"],
    )?;

    let provider_tokens_total = CounterVec::new(
        Opts::new("evalforge_provider_tokens_total", "Tokens reported by providers"),
        &["provider", "type"],
    )?;

    let retries_total = CounterVec::new(
        Opts::new("evalforge_retries_total", "Retries scheduled"),
        &["reason"],
    )?;

    let rate_limit_wait = HistogramVec::new(
        HistogramOpts::new(
            "evalforge_rate_limit_wait_seconds",
            "Time spent waiting for a rate-limit token",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        &["provider"],
    )?;

    let active_calls = Gauge::new("evalforge_active_calls", "Provider calls in flight")?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(active_runs.clone()))?;
    registry.register(Box::new(stage_units_total.clone()))?;
    registry.register(Box::new(provider_calls_total.clone()))?;
    registry.register(Box::new(provider_latency.clone()))?;
    registry.register(Box::new(provider_tokens_total.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(rate_limit_wait.clone()))?;
    registry.register(Box::new(active_calls.clone()))?;

    // Already-set cells mean a previous call won; keep its instances.
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = ACTIVE_RUNS.set(active_runs);
    let _ = STAGE_UNITS_TOTAL.set(stage_units_total);
    let _ = PROVIDER_CALLS_TOTAL.set(provider_calls_total);
    let _ = PROVIDER_LATENCY.set(provider_latency);
    let _ = PROVIDER_TOKENS_TOTAL.set(provider_tokens_total);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = RATE_LIMIT_WAIT.set(rate_limit_wait);
    let _ = ACTIVE_CALLS.set(active_calls);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_recording() {
        init_metrics().unwrap();
        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&["completed"]).inc();
        }
        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("evalforge_runs_total"));
    }
}
