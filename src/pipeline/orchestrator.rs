//! Top-level coordinator for one instruction.
//!
//! The orchestrator routes the instruction, then either drives the edit path
//! (resolve target, run the transformation loop, assemble the result) or the
//! query path (retrieval-grounded answer). Every handled instruction is
//! appended to the conversation history when a store is attached.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::execution::{
    AttemptOutcome, ExecutionEngine, PythonSandbox, SandboxConfig, TransformRuntime,
};
use crate::history::{new_conversation, ConversationStore, NewTurn, RetryPolicy};
use crate::llm::{LiteLlmClient, LlmProvider, Oracle};
use crate::metrics::MetricsCollector;
use crate::resolver::{DataSource, TargetResolver};
use crate::retrieval::{PassageStore, Retriever};
use crate::routing::{DecisionSource, IntentRouter, RoutePath, RoutingDecision};
use crate::synthesis::TransformationSynthesizer;

use super::assembler::{assemble, PipelineResult};
use super::config::PipelineConfig;
use super::knowledge::KnowledgeResponder;

/// One instruction plus the data it may refer to.
#[derive(Debug, Clone, Default)]
pub struct InstructionRequest {
    pub text: String,
    /// File supplied with the instruction; edited directly.
    pub input_file: Option<PathBuf>,
    /// Workbook overriding the configured default.
    pub workbook: Option<PathBuf>,
    /// Conversation to continue; a new one is started when absent.
    pub conversation_id: Option<String>,
}

impl InstructionRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_file = Some(path.into());
        self
    }

    pub fn with_workbook(mut self, path: impl Into<PathBuf>) -> Self {
        self.workbook = Some(path.into());
        self
    }

    pub fn with_conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }
}

/// What the caller gets back for one instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorReply {
    pub conversation_id: String,
    pub path: RoutePath,
    pub routing_source: DecisionSource,
    pub routing_reason: String,
    /// Human-readable reply.
    pub reply: String,
    /// Edit-path result; absent for queries and for runs aborted before
    /// the transformation loop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineResult>,
    /// Documents a knowledge answer drew on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    /// Cause of a fatal failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrchestratorReply {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.result.as_ref().map_or(true, |r| r.success)
    }

    pub fn output_file(&self) -> Option<&Path> {
        self.result.as_ref()?.output_artifact.as_deref()
    }
}

/// Statistics about handled instructions.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub total_handled: u64,
    pub edits: u64,
    pub queries: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_duration: Duration,
}

impl PipelineStats {
    fn record(&mut self, path: RoutePath, success: bool, duration: Duration) {
        self.total_handled += 1;
        match path {
            RoutePath::Edit => self.edits += 1,
            RoutePath::Query => self.queries += 1,
        }
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }

        if self.total_handled == 1 {
            self.average_duration = duration;
        } else {
            // Incremental average: avg = avg + (new - avg) / n
            let n = self.total_handled as f64;
            let old_avg = self.average_duration.as_secs_f64();
            let new_avg = old_avg + (duration.as_secs_f64() - old_avg) / n;
            self.average_duration = Duration::from_secs_f64(new_avg.max(0.0));
        }
    }
}

/// Name of the artifact written for an edit of `source`.
pub fn artifact_path(output_dir: &Path, source: &Path, at: DateTime<Utc>) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "dataset".to_string());
    output_dir.join(format!(
        "{}-updated-{}.parquet",
        stem,
        at.format("%Y%m%d-%H%M%S")
    ))
}

/// What the history keeps for a turn: the reply, plus the code that ran for
/// an edit.
fn history_response(reply: &OrchestratorReply) -> String {
    match &reply.result {
        Some(result) if !result.final_code.is_empty() => {
            format!("{}\n\nGenerated code:\n{}", reply.reply, result.final_code)
        }
        _ => reply.reply.clone(),
    }
}

/// Main coordinator that owns every pipeline component.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    router: IntentRouter,
    resolver: TargetResolver,
    engine: ExecutionEngine,
    knowledge: KnowledgeResponder,
    history: Option<ConversationStore>,
    metrics: MetricsCollector,
    stats: tokio::sync::RwLock<PipelineStats>,
}

impl PipelineOrchestrator {
    /// Wires the components around the given collaborators.
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn LlmProvider>,
        retriever: Arc<dyn Retriever>,
        runtime: Arc<dyn TransformRuntime>,
    ) -> Self {
        let oracle = Oracle::new(provider, config.model.clone(), config.oracle_timeout)
            .with_temperature(config.temperature);

        let router = if config.use_llm_fallback {
            IntentRouter::with_fallback(oracle.clone())
        } else {
            IntentRouter::rules_only()
        };
        let resolver =
            TargetResolver::new(retriever.clone()).with_sheet_marker(config.sheet_marker.clone());
        let synthesizer =
            TransformationSynthesizer::new(oracle.clone()).with_sample_rows(config.sample_rows);
        let engine = ExecutionEngine::new(synthesizer, runtime).with_max_retries(config.max_retries);
        let knowledge = KnowledgeResponder::new(retriever, oracle).with_k(config.retrieval_k);

        Self {
            config,
            router,
            resolver,
            engine,
            knowledge,
            history: None,
            metrics: MetricsCollector::new(),
            stats: tokio::sync::RwLock::new(PipelineStats::default()),
        }
    }

    /// Builds the production stack: LiteLLM client from the environment,
    /// JSON passage index, python sandbox and SQLite history.
    pub async fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let client = LiteLlmClient::from_env()?;
        let retriever: Arc<dyn Retriever> = match &config.passages_path {
            Some(path) => Arc::new(PassageStore::load(path)?),
            None => {
                warn!("No passage index configured; sheet resolution and answers have no context");
                Arc::new(PassageStore::default())
            }
        };
        let runtime = PythonSandbox::new(
            SandboxConfig::new(config.python_bin.clone()).with_timeout(config.sandbox_timeout),
        );
        let history = ConversationStore::open_with(
            &config.history_db,
            RetryPolicy {
                attempts: config.store_retry_attempts,
                backoff: config.store_retry_backoff,
            },
        )
        .await?;

        Ok(Self::new(config, Arc::new(client), retriever, Arc::new(runtime)).with_history(history))
    }

    pub fn with_history(mut self, store: ConversationStore) -> Self {
        self.history = Some(store);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    pub fn history(&self) -> Option<&ConversationStore> {
        self.history.as_ref()
    }

    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Handles one instruction end to end.
    ///
    /// Pipeline failures (unresolvable target, oracle outage, failed
    /// transformation) are reported inside the reply. Only a history store
    /// failure is returned as an error.
    pub async fn handle(&self, request: InstructionRequest) -> Result<OrchestratorReply, PipelineError> {
        let start_time = Instant::now();
        let conversation_id = request
            .conversation_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_conversation);

        let decision = self.router.route(&request.text).await;
        info!(
            conversation = %conversation_id,
            path = decision.path.as_str(),
            source = decision.source.as_str(),
            reason = %decision.reason,
            "Instruction routed"
        );

        let mut reply = match decision.path {
            RoutePath::Edit => self.handle_edit(&request, &decision).await,
            RoutePath::Query => self.handle_query(&request, &decision).await,
        };
        reply.conversation_id = conversation_id;

        let success = reply.succeeded();
        self.metrics.record_run(decision.path.as_str(), success);
        self.stats
            .write()
            .await
            .record(decision.path, success, start_time.elapsed());

        if let Some(store) = &self.history {
            store
                .log_turn(&NewTurn {
                    conv_id: reply.conversation_id.clone(),
                    mode: reply.path,
                    reason: reply.routing_reason.clone(),
                    query: request.text.clone(),
                    response: history_response(&reply),
                    output_file_name: reply
                        .output_file()
                        .and_then(|p| p.file_name())
                        .map(|n| n.to_string_lossy().into_owned()),
                    timestamp: reply.timestamp,
                })
                .await?;
        }

        Ok(reply)
    }

    fn data_source(&self, request: &InstructionRequest) -> Result<DataSource, PipelineError> {
        if let Some(path) = &request.input_file {
            return Ok(DataSource::SuppliedFile(path.clone()));
        }
        request
            .workbook
            .clone()
            .or_else(|| self.config.default_workbook.clone())
            .map(DataSource::Workbook)
            .ok_or(PipelineError::MissingWorkbook)
    }

    async fn handle_edit(
        &self,
        request: &InstructionRequest,
        decision: &RoutingDecision,
    ) -> OrchestratorReply {
        let timestamp = Utc::now();
        let mut reply = empty_reply(decision, timestamp);

        let target = match self.data_source(request) {
            Ok(source) => self
                .resolver
                .resolve(&request.text, &source)
                .await
                .map(|target| (source, target)),
            Err(e) => Err(e),
        };
        let (source, target) = match target {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Edit aborted before transformation");
                reply.reply = e.user_message();
                reply.error = Some(e.to_string());
                return reply;
            }
        };

        let output = artifact_path(&self.config.output_dir, source.path(), timestamp);
        let run = self.engine.run(&request.text, &target.dataset, &output).await;
        let last_outcome = run.last_outcome();
        let last_detail = run.attempts.last().and_then(|a| a.error_detail.clone());
        let attempts = run.attempts.len();
        let result = assemble(decision, &target.spec, run);

        reply.reply = match (&result.output_artifact, last_outcome) {
            (Some(artifact), _) if result.success => {
                let name = artifact
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| artifact.display().to_string());
                format!("Scenario updated: `{}`", name)
            }
            (_, Some(AttemptOutcome::SafetyViolation)) => {
                let err = PipelineError::SafetyViolation(last_detail.unwrap_or_default());
                reply.error = Some(err.to_string());
                err.user_message()
            }
            _ => format!(
                "The change could not be applied after {} attempt{}.",
                attempts,
                if attempts == 1 { "" } else { "s" }
            ),
        };
        reply.result = Some(result);
        reply
    }

    async fn handle_query(
        &self,
        request: &InstructionRequest,
        decision: &RoutingDecision,
    ) -> OrchestratorReply {
        let mut reply = empty_reply(decision, Utc::now());
        match self.knowledge.answer(&request.text).await {
            Ok(answer) => {
                reply.reply = answer.text;
                reply.sources = answer.sources;
            }
            Err(e) => {
                warn!(error = %e, "Knowledge answer failed");
                reply.reply = e.user_message();
                reply.error = Some(e.to_string());
            }
        }
        reply
    }
}

fn empty_reply(decision: &RoutingDecision, timestamp: DateTime<Utc>) -> OrchestratorReply {
    OrchestratorReply {
        conversation_id: String::new(),
        path: decision.path,
        routing_source: decision.source,
        routing_reason: decision.reason.clone(),
        reply: String::new(),
        result: None,
        sources: Vec::new(),
        error: None,
        timestamp,
    }
}
