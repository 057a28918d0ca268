//! Two-stage intent routing.
//!
//! Every instruction is classified as a data edit or an information request.
//! The keyword rules in [`rules`] run first. When they settle on `query`, and a
//! model fallback is configured, the oracle is asked to pick instead; any
//! failure on that path keeps the rule decision.

pub mod rules;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::Oracle;
use crate::metrics::MetricsCollector;
use crate::utils::extract_json_object;

pub use rules::rule_route;

/// The two execution paths an instruction can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePath {
    Edit,
    Query,
}

impl RoutePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePath::Edit => "edit",
            RoutePath::Query => "query",
        }
    }

    /// Parses a model label, accepting the older agent names too.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "edit" | "scenario_editor" | "scenario-editor" => Some(RoutePath::Edit),
            "query" | "rag" | "rag-agent" | "rag_agent" => Some(RoutePath::Query),
            _ => None,
        }
    }
}

impl fmt::Display for RoutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stage produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Rule,
    Model,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Rule => "rule",
            DecisionSource::Model => "model",
        }
    }
}

/// The outcome of routing one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub path: RoutePath,
    pub reason: String,
    pub source: DecisionSource,
}

const ROUTER_SYSTEM_PROMPT: &str =
    "You are an instruction router. Answer with a single JSON object and nothing else.";

/// Few-shot routing prompt; `{instruction}` is replaced with the user text.
const ROUTER_PROMPT: &str = r#"You route instructions in a system with two paths:
1. edit: changes tabular scenario data according to the instruction.
2. query: retrieves or explains information from a knowledge base.

Examples:
User: formulas and variables related to fix_cost, inv_cost, var_cost
Output: {"selected_path": "query", "reason": "User is asking for information, not editing data."}

User: make the inv_cost half
Output: {"selected_path": "edit", "reason": "User is modifying data values."}

User: rename the column 'investment_cost' to 'inv_cost' and save the file
Output: {"selected_path": "edit", "reason": "Explicit data transformation."}

User: read the inv_cost sheet, double the solar value and give me the updated file
Output: {"selected_path": "edit", "reason": "Requires reading, editing and writing the data."}

Decide which path should handle this input: {instruction}
Output format, strictly JSON:
{"selected_path": "edit" or "query", "reason": "<short explanation>"}"#;

/// Builds the fallback prompt for one instruction.
pub fn build_router_prompt(instruction: &str) -> String {
    ROUTER_PROMPT.replace("{instruction}", instruction)
}

/// Extracts `(path, reason)` from a model answer.
///
/// Accepts `selected_path` or `selected_agent`; anything else is `None`.
pub fn parse_model_decision(answer: &str) -> Option<(RoutePath, String)> {
    let json = extract_json_object(answer)?;
    let value: Value = serde_json::from_str(json).ok()?;
    let label = value
        .get("selected_path")
        .or_else(|| value.get("selected_agent"))?
        .as_str()?;
    let path = RoutePath::from_label(label)?;
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "model decision".to_string());
    Some((path, reason))
}

/// Routes instructions with the keyword rules and an optional model fallback.
#[derive(Debug, Clone, Default)]
pub struct IntentRouter {
    fallback: Option<Oracle>,
    metrics: MetricsCollector,
}

impl IntentRouter {
    /// A router that only uses the keyword rules.
    pub fn rules_only() -> Self {
        Self::default()
    }

    /// A router that consults `oracle` when the rules pick `query`.
    pub fn with_fallback(oracle: Oracle) -> Self {
        Self {
            fallback: Some(oracle),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Produces exactly one decision for `instruction`. Never fails.
    pub async fn route(&self, instruction: &str) -> RoutingDecision {
        let rule_decision = rule_route(instruction);

        let decision = match (&self.fallback, rule_decision.path) {
            (Some(oracle), RoutePath::Query) => self.consult(oracle, instruction, rule_decision).await,
            _ => rule_decision,
        };

        debug!(
            path = decision.path.as_str(),
            source = decision.source.as_str(),
            reason = %decision.reason,
            "Instruction routed"
        );
        self.metrics
            .record_routing(decision.path.as_str(), decision.source.as_str());

        decision
    }

    async fn consult(
        &self,
        oracle: &Oracle,
        instruction: &str,
        rule_decision: RoutingDecision,
    ) -> RoutingDecision {
        let answer = match oracle
            .complete(Some(ROUTER_SYSTEM_PROMPT), &build_router_prompt(instruction))
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Routing fallback failed, keeping rule decision");
                return rule_decision;
            }
        };

        match parse_model_decision(&answer) {
            Some((path, reason)) => RoutingDecision {
                path,
                reason,
                source: DecisionSource::Model,
            },
            None => {
                warn!(
                    answer = %crate::utils::truncate_chars(&answer, 200),
                    "Unparseable routing answer, keeping rule decision"
                );
                rule_decision
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::oracle::testing::ScriptedProvider;
    use std::sync::Arc;
    use std::time::Duration;

    fn router_with(provider: Arc<ScriptedProvider>) -> IntentRouter {
        IntentRouter::with_fallback(Oracle::new(provider, "router-model", Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_edit_keyword_skips_oracle() {
        let provider = Arc::new(ScriptedProvider::answering(
            r#"{"selected_path": "query", "reason": "x"}"#,
        ));
        let router = router_with(provider.clone());

        let decision = router.route("increase inv_cost by 10%").await;
        assert_eq!(decision.path, RoutePath::Edit);
        assert_eq!(decision.source, DecisionSource::Rule);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_question_consults_oracle() {
        let provider = Arc::new(ScriptedProvider::answering(
            r#"{"selected_path": "query", "reason": "asks how to do it"}"#,
        ));
        let router = router_with(provider.clone());

        let decision = router.route("how can I change inv_cost?").await;
        assert_eq!(decision.path, RoutePath::Query);
        assert_eq!(decision.source, DecisionSource::Model);
        assert_eq!(decision.reason, "asks how to do it");
        assert_eq!(provider.calls(), 1);
        assert!(provider.prompts.lock().expect("lock")[0].contains("how can I change inv_cost?"));
    }

    #[tokio::test]
    async fn test_model_can_override_to_edit() {
        let provider = Arc::new(ScriptedProvider::answering(
            "Sure.\n```json\n{\"selected_agent\": \"scenario_editor\", \"reason\": \"halving values\"}\n```",
        ));
        let decision = router_with(provider).route("inv_cost half please").await;
        assert_eq!(decision.path, RoutePath::Edit);
        assert_eq!(decision.source, DecisionSource::Model);
    }

    #[tokio::test]
    async fn test_fallback_failures_keep_rule_decision() {
        for provider in [
            ScriptedProvider::failing("connection refused"),
            ScriptedProvider::answering("I think it is an edit"),
            ScriptedProvider::answering(r#"{"selected_path": "delete everything"}"#),
        ] {
            let decision = router_with(Arc::new(provider))
                .route("how can I change inv_cost?")
                .await;
            assert_eq!(decision, rule_route("how can I change inv_cost?"));
        }
    }

    #[tokio::test]
    async fn test_routing_is_idempotent() {
        let provider = Arc::new(ScriptedProvider::answering(
            r#"{"selected_path": "query", "reason": "info"}"#,
        ));
        let router = router_with(provider);
        let first = router.route("what is inv_cost?").await;
        let second = router.route("what is inv_cost?").await;
        assert_eq!(first, second);

        let rules = IntentRouter::rules_only();
        assert_eq!(
            rules.route("double the solar value").await,
            rules.route("double the solar value").await
        );
    }

    #[test]
    fn test_parse_model_decision_defaults_reason() {
        assert_eq!(
            parse_model_decision(r#"{"selected_path": "EDIT"}"#),
            Some((RoutePath::Edit, "model decision".to_string()))
        );
        assert_eq!(
            parse_model_decision(r#"{"selected_agent": "rag", "reason": " lookup "}"#),
            Some((RoutePath::Query, "lookup".to_string()))
        );
        assert_eq!(parse_model_decision(r#"{"reason": "none"}"#), None);
    }

    #[test]
    fn test_prompt_contains_instruction() {
        let prompt = build_router_prompt("make the inv_cost half");
        assert!(prompt.ends_with("\"reason\": \"<short explanation>\"}"));
        assert!(prompt.contains("this input: make the inv_cost half"));
    }
}
