//! Error types for peach operations.
//!
//! Defines error types for the subsystems the pipeline talks to:
//! - LLM oracle calls
//! - Tabular sources and sinks
//! - Passage retrieval
//! - Conversation history storage
//! - The routing/transformation pipeline itself

use thiserror::Error;

use crate::pipeline::config::ConfigError;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY or OPENROUTER_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("LLM call timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("LLM returned no content")]
    EmptyResponse,
}

/// Errors that can occur while reading or writing tabular data.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Unsupported tabular source '{0}': expected a .json workbook, a .parquet file or a directory of .parquet files")]
    UnsupportedFormat(String),

    #[error("Source '{0}' contains no sheets")]
    EmptySource(String),

    #[error("Row {row} has {actual} cells but the sheet declares {expected} columns")]
    RaggedRow {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported column type {data_type} for column '{column}'")]
    UnsupportedColumnType { column: String, data_type: String },

    #[error("Invalid dataset: {0}")]
    Invalid(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during passage retrieval.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Invalid passage index: {0}")]
    InvalidIndex(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur in the conversation history store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("History store still locked after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Invalid turn: {0}")]
    InvalidTurn(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fatal errors of a single pipeline invocation.
///
/// Runtime errors raised by generated code never show up here: they are
/// absorbed by the retry loop and reported inside the `PipelineResult`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No sheet named '{sheet}' found in {origin}")]
    TargetNotFound { sheet: String, origin: String },

    #[error("Could not identify a target sheet for the instruction: {0}")]
    TargetUnresolved(String),

    #[error("Unsafe code detected, execution blocked: {0}")]
    SafetyViolation(String),

    #[error("No workbook available: pass an input file or configure a default workbook")]
    MissingWorkbook,

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("History store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Short message suitable for showing to the person who typed the instruction.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::TargetNotFound { sheet, .. } => {
                format!("I could not find a sheet called '{}' in the scenario file.", sheet)
            }
            PipelineError::TargetUnresolved(_) => {
                "I could not work out which sheet this instruction refers to.".to_string()
            }
            PipelineError::SafetyViolation(_) => {
                "The generated transformation was blocked by the safety check.".to_string()
            }
            PipelineError::MissingWorkbook => {
                "Upload a scenario file or configure a default workbook first.".to_string()
            }
            other => format!("The request failed: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_not_found_message_names_sheet() {
        let err = PipelineError::TargetNotFound {
            sheet: "inv_cost".to_string(),
            origin: "scenario.json".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No sheet named 'inv_cost' found in scenario.json"
        );
        assert!(err.user_message().contains("inv_cost"));
    }

    #[test]
    fn test_store_contention_display() {
        let err = StoreError::Contention { attempts: 5 };
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn test_llm_error_converts_into_pipeline_error() {
        let err: PipelineError = LlmError::Timeout { seconds: 3 }.into();
        assert!(matches!(err, PipelineError::Llm(LlmError::Timeout { seconds: 3 })));
    }
}
