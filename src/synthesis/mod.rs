//! Turns an edit instruction into pandas code.
//!
//! One oracle call per transformation. The prompt carries the column schema,
//! a few sample rows, the instruction and a fixed rule set; on retries the
//! previous error is appended as feedback.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Dataset;
use crate::error::LlmError;
use crate::llm::Oracle;
use crate::utils::strip_code_fences;

/// Default number of sample rows shown to the model.
pub const DEFAULT_SAMPLE_ROWS: usize = 5;

const SYNTHESIS_SYSTEM_PROMPT: &str =
    "You are a data engineer working with energy and climate scenario data. \
     You answer with Python code only.";

const TRANSFORMATION_RULES: &str = r#"TASK:
Write Python code using only pandas and numpy that applies the instruction by modifying the pandas DataFrame `df` in place.

LOGIC RULES (strict):
1. Apply temporal filters (e.g. "after 2030") BEFORE any aggregation or analysis.
2. For "most/least expensive", compare MEAN values unless told otherwise.
3. Identify technologies or categories by name or id, NEVER by matching float values.
4. Scope, then aggregate, then modify, in that order.
5. Use vectorized selection only: no loops and no `.apply`.

CODING RULES:
- Assign through `.loc[...]` on `df`.
- Filter strings with `.str.contains(..., case=False, na=False)` rather than exact matches.
- Keep every row and column unless the instruction explicitly asks to drop them.
- Drop rows only through boolean indexing or `df.drop(...)`.
- Sort by time columns (e.g. `year`, `year_vtg`) when a trend is implied.

FORBIDDEN:
- File I/O, system calls, environment access, network access.
- Defining functions or classes.
- Importing anything except pandas and numpy; os, sys, pathlib, subprocess, eval and exec are never allowed.
- Attribute names with double underscores.

OUTPUT:
- Return ONLY valid Python code.
- No explanations.
- No markdown."#;

/// Validation state of one generated transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Passed,
    Rejected,
}

/// Code produced for one attempt.
///
/// Each retry produces a new value; validation yields a new value with the
/// updated status instead of changing this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTransformation {
    pub source_text: String,
    pub attempt_index: u32,
    pub validation_status: ValidationStatus,
}

impl GeneratedTransformation {
    pub fn pending(source_text: impl Into<String>, attempt_index: u32) -> Self {
        Self {
            source_text: source_text.into(),
            attempt_index,
            validation_status: ValidationStatus::Pending,
        }
    }

    /// The validated form, carrying the normalized code.
    pub fn passed(&self, normalized_code: impl Into<String>) -> Self {
        Self {
            source_text: normalized_code.into(),
            attempt_index: self.attempt_index,
            validation_status: ValidationStatus::Passed,
        }
    }

    pub fn rejected(&self) -> Self {
        Self {
            validation_status: ValidationStatus::Rejected,
            ..self.clone()
        }
    }
}

/// Renders the synthesis prompt.
pub fn build_prompt(
    instruction: &str,
    dataset: &Dataset,
    sample_rows: usize,
    feedback: Option<&str>,
) -> String {
    let schema = serde_json::to_string(dataset.columns()).unwrap_or_default();
    let samples = dataset.sample_records(sample_rows);

    let mut prompt = format!(
        "You are given a pandas DataFrame named `df`.\n\n\
         Schema:\n{}\n\n\
         Sample rows:\n{}\n\n\
         Instruction:\n{}\n\n\
         {}",
        schema,
        if samples.is_empty() { "(no rows)" } else { samples.as_str() },
        instruction,
        TRANSFORMATION_RULES
    );

    if let Some(feedback) = feedback {
        prompt.push_str("\n\nFix the issue described here: ");
        prompt.push_str(feedback);
    }

    prompt
}

/// Requests transformation code from the oracle.
#[derive(Debug, Clone)]
pub struct TransformationSynthesizer {
    oracle: Oracle,
    sample_rows: usize,
}

impl TransformationSynthesizer {
    pub fn new(oracle: Oracle) -> Self {
        Self {
            oracle,
            sample_rows: DEFAULT_SAMPLE_ROWS,
        }
    }

    pub fn with_sample_rows(mut self, sample_rows: usize) -> Self {
        self.sample_rows = sample_rows;
        self
    }

    /// Generates the code for attempt `attempt_index`.
    pub async fn synthesize(
        &self,
        instruction: &str,
        dataset: &Dataset,
        feedback: Option<&str>,
        attempt_index: u32,
    ) -> Result<GeneratedTransformation, LlmError> {
        let prompt = build_prompt(instruction, dataset, self.sample_rows, feedback);
        let answer = self
            .oracle
            .complete(Some(SYNTHESIS_SYSTEM_PROMPT), &prompt)
            .await?;

        let code = strip_code_fences(&answer);
        if code.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        debug!(
            attempt = attempt_index,
            with_feedback = feedback.is_some(),
            code_len = code.len(),
            "Transformation synthesized"
        );

        Ok(GeneratedTransformation::pending(code, attempt_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Cell;
    use crate::llm::oracle::testing::ScriptedProvider;
    use std::sync::Arc;
    use std::time::Duration;

    fn costs(rows: usize) -> Dataset {
        Dataset::new(
            vec!["technology".into(), "year_vtg".into(), "inv_cost".into()],
            (0..rows)
                .map(|i| {
                    vec![
                        Cell::from(format!("tech_{}", i)),
                        Cell::from(2020 + i as i64),
                        Cell::from(100.0 + i as f64),
                    ]
                })
                .collect(),
        )
        .expect("valid")
    }

    #[test]
    fn test_prompt_has_schema_samples_and_rules() {
        let prompt = build_prompt("increase inv_cost by 10%", &costs(8), 5, None);
        assert!(prompt.contains(r#"["technology","year_vtg","inv_cost"]"#));
        assert!(prompt.contains("tech_4"));
        assert!(!prompt.contains("tech_5"));
        assert!(prompt.contains("Instruction:\nincrease inv_cost by 10%"));
        assert!(prompt.contains("no loops and no `.apply`"));
        assert!(!prompt.contains("Fix the issue"));
    }

    #[test]
    fn test_prompt_appends_feedback_verbatim() {
        let prompt = build_prompt("x", &costs(1), 5, Some("KeyError: 'inv_costs'"));
        assert!(prompt.ends_with("Fix the issue described here: KeyError: 'inv_costs'"));
    }

    #[test]
    fn test_prompt_for_empty_sheet() {
        let prompt = build_prompt("x", &costs(0), 5, None);
        assert!(prompt.contains("Sample rows:\n(no rows)"));
    }

    #[test]
    fn test_status_transitions_produce_new_values() {
        let pending = GeneratedTransformation::pending("df = df", 2);
        let passed = pending.passed("import pandas as pd\ndf = df");
        let rejected = pending.rejected();

        assert_eq!(pending.validation_status, ValidationStatus::Pending);
        assert_eq!(passed.validation_status, ValidationStatus::Passed);
        assert_eq!(passed.attempt_index, 2);
        assert_eq!(rejected.validation_status, ValidationStatus::Rejected);
        assert_eq!(rejected.source_text, "df = df");
    }

    #[tokio::test]
    async fn test_synthesize_strips_fences() {
        let provider = Arc::new(ScriptedProvider::answering(
            "```python\ndf.loc[:, 'inv_cost'] = df['inv_cost'] * 1.1\n```",
        ));
        let synthesizer =
            TransformationSynthesizer::new(Oracle::new(provider.clone(), "m", Duration::from_secs(5)));

        let generated = synthesizer
            .synthesize("increase inv_cost by 10%", &costs(2), Some("boom"), 1)
            .await
            .expect("synthesized");

        assert_eq!(
            generated,
            GeneratedTransformation::pending("df.loc[:, 'inv_cost'] = df['inv_cost'] * 1.1", 1)
        );
        assert!(provider.prompts.lock().expect("lock")[0].ends_with("boom"));
    }

    #[tokio::test]
    async fn test_fence_only_answer_is_empty() {
        let provider = Arc::new(ScriptedProvider::answering("```python\n```"));
        let synthesizer =
            TransformationSynthesizer::new(Oracle::new(provider, "m", Duration::from_secs(5)));
        assert!(matches!(
            synthesizer.synthesize("x", &costs(1), None, 0).await,
            Err(LlmError::EmptyResponse)
        ));
    }
}
