//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by peach and provides
//! functions for initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all peach metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Routing decisions, labeled by selected path and deciding stage.
pub static ROUTING_DECISIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Execution attempts, labeled by outcome.
pub static EXECUTION_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Completed pipeline runs, labeled by path and result.
pub static PIPELINE_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Oracle calls, labeled by model and status.
pub static ORACLE_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Oracle call latency in seconds, labeled by model.
pub static ORACLE_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling it again is harmless: the first set of
/// metrics stays registered.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let routing_decisions = CounterVec::new(
        Opts::new("peach_routing_decisions_total", "Routing decisions made"),
        &["path", "source"],
    )?;

    let execution_attempts = CounterVec::new(
        Opts::new(
            "peach_execution_attempts_total",
            "Transformation execution attempts",
        ),
        &["outcome"],
    )?;

    let pipeline_runs = CounterVec::new(
        Opts::new("peach_pipeline_runs_total", "Completed pipeline runs"),
        &["path", "result"],
    )?;

    let oracle_requests = CounterVec::new(
        Opts::new("peach_oracle_requests_total", "Total oracle calls"),
        &["model", "status"],
    )?;

    let oracle_latency = HistogramVec::new(
        HistogramOpts::new("peach_oracle_latency_seconds", "Oracle call latency in seconds")
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model"],
    )?;

    registry.register(Box::new(routing_decisions.clone()))?;
    registry.register(Box::new(execution_attempts.clone()))?;
    registry.register(Box::new(pipeline_runs.clone()))?;
    registry.register(Box::new(oracle_requests.clone()))?;
    registry.register(Box::new(oracle_latency.clone()))?;

    // A concurrent initializer may have won the race; its metrics stay.
    let _ = REGISTRY.set(registry);
    let _ = ROUTING_DECISIONS_TOTAL.set(routing_decisions);
    let _ = EXECUTION_ATTEMPTS_TOTAL.set(execution_attempts);
    let _ = PIPELINE_RUNS_TOTAL.set(pipeline_runs);
    let _ = ORACLE_REQUESTS_TOTAL.set(oracle_requests);
    let _ = ORACLE_LATENCY.set(oracle_latency);

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
        init_metrics().expect("metrics init");
        if let Some(counter) = ROUTING_DECISIONS_TOTAL.get() {
            counter.with_label_values(&["edit", "rule"]).inc();
        }

        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("peach_routing_decisions_total"));
    }
}
