//! Folds routing, target and attempt history into the result surface.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::execution::ExecutionRun;
use crate::resolver::TargetSpec;
use crate::routing::RoutingDecision;

/// Outcome of one edit run, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    /// Code of the last attempt, also when the run failed.
    pub final_code: String,
    /// Chronological log lines.
    pub logs: Vec<String>,
    /// Present only when `success` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_artifact: Option<PathBuf>,
}

/// Builds the [`PipelineResult`] for a finished run.
pub fn assemble(routing: &RoutingDecision, target: &TargetSpec, run: ExecutionRun) -> PipelineResult {
    let success = run.succeeded();
    let final_code = run.final_code();

    let mut logs = Vec::with_capacity(run.logs.len() + 3);
    logs.push(format!(
        "Routed to {} ({}): {}",
        routing.path.as_str(),
        routing.source.as_str(),
        routing.reason
    ));
    if let Some(sheet) = &target.sheet_name {
        match &target.resolution_reason {
            Some(reason) => logs.push(format!("Target sheet: {} ({})", sheet, reason)),
            None => logs.push(format!("Target sheet: {}", sheet)),
        }
    }
    logs.extend(run.logs);

    let attempts = run.attempts.len();
    match run.attempts.last() {
        Some(_) if success => logs.push(format!(
            "Transformation succeeded after {} attempt{}.",
            attempts,
            if attempts == 1 { "" } else { "s" }
        )),
        Some(last) => logs.push(format!(
            "Transformation failed after {} attempt{} ({}).",
            attempts,
            if attempts == 1 { "" } else { "s" },
            last.outcome
        )),
        None => logs.push("Transformation produced no attempts.".to_string()),
    }

    PipelineResult {
        success,
        final_code,
        logs,
        output_artifact: if success { run.output_artifact } else { None },
    }
}
