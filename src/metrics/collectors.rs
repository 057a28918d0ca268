//! Recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use super::prometheus::{
    EXECUTION_ATTEMPTS_TOTAL, ORACLE_LATENCY, ORACLE_REQUESTS_TOTAL, PIPELINE_RUNS_TOTAL,
    ROUTING_DECISIONS_TOTAL,
};

/// Metrics collector for pipeline operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a routing decision.
    ///
    /// * `path` - "edit" or "query"
    /// * `source` - "rule" or "model"
    pub fn record_routing(&self, path: &str, source: &str) {
        if let Some(counter) = ROUTING_DECISIONS_TOTAL.get() {
            counter.with_label_values(&[path, source]).inc();
        }
        tracing::trace!(path, source, "Recorded routing metric");
    }

    /// Record one execution attempt by outcome label.
    pub fn record_attempt(&self, outcome: &str) {
        if let Some(counter) = EXECUTION_ATTEMPTS_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }

    /// Record a finished pipeline run.
    pub fn record_run(&self, path: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        if let Some(counter) = PIPELINE_RUNS_TOTAL.get() {
            counter.with_label_values(&[path, result]).inc();
        }
        tracing::trace!(path, result, "Recorded pipeline run metric");
    }

    /// Record an oracle call.
    ///
    /// * `status` - "success", "error" or "timeout"
    pub fn record_oracle_call(&self, model: &str, status: &str, latency_secs: f64) {
        if let Some(counter) = ORACLE_REQUESTS_TOTAL.get() {
            counter.with_label_values(&[model, status]).inc();
        }
        if let Some(histogram) = ORACLE_LATENCY.get() {
            histogram.with_label_values(&[model]).observe(latency_secs);
        }
        tracing::trace!(model, status, latency_secs, "Recorded oracle metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_shows_up_in_export() {
        init_metrics().expect("metrics init");
        let collector = MetricsCollector::new();
        collector.record_attempt("runtime_error");
        collector.record_run("edit", false);
        collector.record_oracle_call("test-model", "success", 0.2);

        let text = export_metrics();
        assert!(text.contains("peach_execution_attempts_total"));
        assert!(text.contains("peach_pipeline_runs_total"));
        assert!(text.contains("peach_oracle_latency_seconds"));
    }

    #[test]
    fn test_recording_without_init_does_not_panic() {
        // Whether or not another test initialized the registry first,
        // recording must be safe.
        MetricsCollector::new().record_routing("query", "model");
    }
}
