//! Synthesize, validate, execute and retry.
//!
//! The engine drives one edit instruction through a bounded loop:
//!
//! ```text
//! Synthesizing -> Validating -> Executing -> Succeeded
//!      ^                            |
//!      +------ (error feedback) ----+ -> Failed (budget spent)
//! Validating -> Failed (safety violation, no retry)
//! ```
//!
//! Every execution sees a fresh working copy of the dataset. At most
//! `max_retries + 1` attempts are made. Nothing escapes the loop as an error:
//! the outcome is reported through [`ExecutionRun`].

pub mod sandbox;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::{write_dataset, Dataset};
use crate::metrics::MetricsCollector;
use crate::safety::SafetyValidator;
use crate::synthesis::{GeneratedTransformation, TransformationSynthesizer};

pub use sandbox::{PythonSandbox, SandboxConfig, SandboxError, TransformRuntime};

/// Default retry budget (four attempts in total).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RuntimeError,
    SafetyViolation,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::RuntimeError => "runtime_error",
            AttemptOutcome::SafetyViolation => "safety_violation",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record of one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub transformation: GeneratedTransformation,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
    pub resulting_dataset: Option<Dataset>,
}

/// Loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Synthesizing,
    Validating,
    Executing,
    Succeeded,
    Failed,
}

/// Everything the loop produced, in order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRun {
    pub attempts: Vec<ExecutionAttempt>,
    pub logs: Vec<String>,
    pub output_artifact: Option<PathBuf>,
}

impl ExecutionRun {
    /// True iff the last attempt succeeded.
    pub fn succeeded(&self) -> bool {
        self.attempts
            .last()
            .is_some_and(|a| a.outcome == AttemptOutcome::Success)
    }

    /// Code of the most recent attempt that produced any.
    pub fn final_code(&self) -> String {
        self.attempts
            .iter()
            .rev()
            .map(|a| a.transformation.source_text.as_str())
            .find(|code| !code.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    pub fn last_outcome(&self) -> Option<AttemptOutcome> {
        self.attempts.last().map(|a| a.outcome)
    }
}

/// Drives the synthesize/validate/execute loop for edit instructions.
pub struct ExecutionEngine {
    synthesizer: TransformationSynthesizer,
    validator: SafetyValidator,
    runtime: Arc<dyn TransformRuntime>,
    max_retries: u32,
    metrics: MetricsCollector,
}

impl ExecutionEngine {
    pub fn new(synthesizer: TransformationSynthesizer, runtime: Arc<dyn TransformRuntime>) -> Self {
        Self {
            synthesizer,
            validator: SafetyValidator::new(),
            runtime,
            max_retries: DEFAULT_MAX_RETRIES,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_validator(mut self, validator: SafetyValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries as usize + 1
    }

    /// Runs the loop for `instruction` against `dataset`, writing the result
    /// to `artifact_path` on success. `dataset` itself is never modified.
    pub async fn run(&self, instruction: &str, dataset: &Dataset, artifact_path: &Path) -> ExecutionRun {
        let mut run = ExecutionRun::default();
        run.logs.push(format!(
            "Loaded dataset with {} rows and {} columns.",
            dataset.row_count(),
            dataset.column_count()
        ));
        run.logs.push(format!("Columns: {:?}", dataset.columns()));

        let mut state = EngineState::Synthesizing;
        let mut feedback: Option<String> = None;
        let mut current: Option<GeneratedTransformation> = None;

        loop {
            let attempt_index = run.attempts.len() as u32;
            state = match state {
                EngineState::Synthesizing => {
                    match self
                        .synthesizer
                        .synthesize(instruction, dataset, feedback.as_deref(), attempt_index)
                        .await
                    {
                        Ok(generated) => {
                            run.logs
                                .push(format!("Generated code (attempt {}):", attempt_index + 1));
                            run.logs.push(generated.source_text.clone());
                            current = Some(generated);
                            EngineState::Validating
                        }
                        Err(e) => {
                            let detail = format!("code generation failed: {}", e);
                            let placeholder = GeneratedTransformation::pending("", attempt_index);
                            self.record_failure(&mut run, placeholder, detail, &mut feedback)
                        }
                    }
                }
                EngineState::Validating => {
                    let Some(generated) = current.take() else {
                        break;
                    };
                    match self.validator.validate(&generated.source_text) {
                        Ok(validated) => {
                            for import in &validated.injected_imports {
                                run.logs.push(format!("Auto-added: {}", import));
                            }
                            current = Some(generated.passed(validated.code));
                            EngineState::Executing
                        }
                        Err(violation) => {
                            warn!(attempt = attempt_index + 1, %violation, "Generated code rejected");
                            run.logs
                                .push(format!("Unsafe code detected, execution blocked: {}", violation));
                            self.push_attempt(
                                &mut run,
                                ExecutionAttempt {
                                    transformation: generated.rejected(),
                                    outcome: AttemptOutcome::SafetyViolation,
                                    error_detail: Some(violation.to_string()),
                                    resulting_dataset: None,
                                },
                            );
                            EngineState::Failed
                        }
                    }
                }
                EngineState::Executing => {
                    let Some(transformation) = current.take() else {
                        break;
                    };
                    match self
                        .runtime
                        .execute(&transformation.source_text, dataset.working_copy())
                        .await
                    {
                        Ok(result) => match write_dataset(&result, artifact_path) {
                            Ok(()) => {
                                run.logs.push(format!(
                                    "Saved updated file to {}",
                                    artifact_path.display()
                                ));
                                run.output_artifact = Some(artifact_path.to_path_buf());
                                self.push_attempt(
                                    &mut run,
                                    ExecutionAttempt {
                                        transformation,
                                        outcome: AttemptOutcome::Success,
                                        error_detail: None,
                                        resulting_dataset: Some(result),
                                    },
                                );
                                EngineState::Succeeded
                            }
                            Err(e) => {
                                let detail = format!("failed to write output: {}", e);
                                self.record_failure(&mut run, transformation, detail, &mut feedback)
                            }
                        },
                        Err(e) => {
                            self.record_failure(&mut run, transformation, e.to_string(), &mut feedback)
                        }
                    }
                }
                EngineState::Succeeded | EngineState::Failed => break,
            };
        }

        info!(
            attempts = run.attempts.len(),
            outcome = run.last_outcome().map(|o| o.as_str()).unwrap_or("none"),
            "Transformation loop finished"
        );

        run
    }

    /// Records a runtime error and decides whether another attempt fits in
    /// the budget.
    fn record_failure(
        &self,
        run: &mut ExecutionRun,
        transformation: GeneratedTransformation,
        detail: String,
        feedback: &mut Option<String>,
    ) -> EngineState {
        warn!(
            attempt = transformation.attempt_index + 1,
            error = %detail,
            "Transformation attempt failed"
        );
        run.logs.push(format!("Error executing code: {}", detail));
        self.push_attempt(
            run,
            ExecutionAttempt {
                transformation,
                outcome: AttemptOutcome::RuntimeError,
                error_detail: Some(detail.clone()),
                resulting_dataset: None,
            },
        );

        if run.attempts.len() < self.max_attempts() {
            run.logs.push("Retrying with fix...".to_string());
            *feedback = Some(detail);
            EngineState::Synthesizing
        } else {
            EngineState::Failed
        }
    }

    fn push_attempt(&self, run: &mut ExecutionRun, attempt: ExecutionAttempt) {
        self.metrics.record_attempt(attempt.outcome.as_str());
        run.attempts.push(attempt);
    }
}
