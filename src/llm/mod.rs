//! LLM integration for peach.
//!
//! The model is an opaque text-completion oracle reached through the
//! [`LlmProvider`] trait. [`LiteLlmClient`] talks to any OpenAI-compatible
//! endpoint; [`Oracle`] adds the per-call timeout and metrics the pipeline
//! stages rely on.
//!
//! ```ignore
//! use peach::llm::{LiteLlmClient, Oracle};
//! use std::{sync::Arc, time::Duration};
//!
//! let client = LiteLlmClient::from_env()?;
//! let oracle = Oracle::new(Arc::new(client), "", Duration::from_secs(120));
//! let text = oracle.complete(None, "Say hello").await?;
//! ```

pub mod litellm;
pub mod oracle;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL, OPENROUTER_BASE_URL,
};
pub use oracle::Oracle;
