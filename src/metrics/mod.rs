//! Prometheus metrics for routing and transformation runs.
//!
//! ```ignore
//! use peach::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_routing("edit", "rule");
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{
    export_metrics, init_metrics, EXECUTION_ATTEMPTS_TOTAL, ORACLE_LATENCY,
    ORACLE_REQUESTS_TOTAL, PIPELINE_RUNS_TOTAL, REGISTRY, ROUTING_DECISIONS_TOTAL,
};
