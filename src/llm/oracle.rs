//! Text-completion helper over an [`LlmProvider`].
//!
//! Every pipeline stage that needs the model (routing fallback, code
//! synthesis, knowledge answers) goes through [`Oracle::complete`], which adds
//! the per-call timeout and records latency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::LlmError;
use crate::metrics::MetricsCollector;

use super::litellm::{GenerationRequest, LlmProvider, Message};

/// A configured handle on the text-completion oracle.
#[derive(Clone)]
pub struct Oracle {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: Option<f64>,
    timeout: Duration,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for Oracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oracle")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Oracle {
    /// Wraps a provider. An empty `model` defers to the provider's default.
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            timeout,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends one prompt and returns the first choice's text.
    ///
    /// Timeouts, transport failures and empty answers all come back as
    /// `LlmError`; callers decide whether that is fatal.
    pub async fn complete(&self, system: Option<&str>, prompt: &str) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));

        let mut request = GenerationRequest::new(self.model.clone(), messages);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        let model_label = if self.model.is_empty() {
            "default"
        } else {
            self.model.as_str()
        };
        let started = Instant::now();

        let outcome = tokio::time::timeout(self.timeout, self.provider.generate(request)).await;
        let elapsed = started.elapsed().as_secs_f64();

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.metrics.record_oracle_call(model_label, "error", elapsed);
                return Err(e);
            }
            Err(_) => {
                self.metrics.record_oracle_call(model_label, "timeout", elapsed);
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Oracle call timed out"
                );
                return Err(LlmError::Timeout {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        self.metrics.record_oracle_call(model_label, "success", elapsed);

        let content = response.first_content().unwrap_or_default().trim();
        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        tracing::debug!(
            model = model_label,
            latency_secs = elapsed,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "Oracle call completed"
        );

        Ok(content.to_string())
    }
}
