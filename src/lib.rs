//! peach: natural-language editing of energy scenario data.
//!
//! An instruction is routed either to a retrieval-grounded answer or to a
//! data edit. Edits are synthesized as pandas code by an LLM, checked
//! against a denylist and import allowlist, executed in a sandboxed
//! `python3` process and retried with the error as feedback.

pub mod cli;
pub mod dataset;
pub mod error;
pub mod execution;
pub mod history;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod resolver;
pub mod retrieval;
pub mod routing;
pub mod safety;
pub mod synthesis;
pub mod utils;

// Re-export commonly used error types
pub use error::{DatasetError, LlmError, PipelineError, RetrievalError, StoreError};
