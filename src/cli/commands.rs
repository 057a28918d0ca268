//! CLI command definitions for peach.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::history::ConversationStore;
use crate::llm::{LiteLlmClient, Oracle};
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{InstructionRequest, OrchestratorReply, PipelineConfig, PipelineOrchestrator};
use crate::routing::IntentRouter;
use crate::safety::SafetyValidator;

/// Natural-language editing of energy scenario data.
#[derive(Parser)]
#[command(name = "peach")]
#[command(about = "Route instructions, answer questions and apply safe edits to scenario data")]
#[command(version)]
#[command(
    long_about = "peach routes a natural-language instruction either to a knowledge answer or to a data edit.\n\nEdits are turned into pandas code by an LLM, checked, executed in a sandboxed python3 process and retried with the error as feedback.\n\nExample usage:\n  peach ask \"increase inv_cost by 10% for solar\" --workbook data/scenario.json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file; PEACH_* variables override it.
    #[arg(short = 'c', long, global = true, env = "PEACH_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Handle one instruction: answer it or apply it to the data.
    Ask(AskArgs),

    /// Show how an instruction would be routed.
    Route(RouteArgs),

    /// Run the safety checks on a file of generated code.
    Check(CheckArgs),

    /// Print the turns of a conversation.
    History(HistoryArgs),

    /// Print the Prometheus metrics exposition.
    Metrics,
}

#[derive(clap::Args)]
pub struct AskArgs {
    /// The instruction or question.
    pub instruction: String,

    /// Dataset file to edit directly (skips sheet resolution).
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Workbook to search for the target sheet.
    #[arg(short = 'w', long)]
    pub workbook: Option<PathBuf>,

    /// Conversation to continue.
    #[arg(long)]
    pub conversation: Option<String>,

    /// Model override.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Retries after the first attempt.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Passage index (JSON).
    #[arg(long)]
    pub passages: Option<PathBuf>,

    /// Output directory for updated datasets.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Route with the keyword rules only.
    #[arg(long)]
    pub no_fallback: bool,

    /// Print metrics after handling the instruction.
    #[arg(long)]
    pub metrics: bool,

    /// Output result as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct RouteArgs {
    /// The instruction to route.
    pub instruction: String,

    /// Route with the keyword rules only.
    #[arg(long)]
    pub no_fallback: bool,

    /// Output result as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct CheckArgs {
    /// File holding the code to check.
    pub code_file: PathBuf,

    /// Output result as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct HistoryArgs {
    /// Conversation id.
    pub conversation_id: String,

    /// History database override.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Output result as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    let config = PipelineConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Ask(args) => run_ask_command(config, args).await,
        Commands::Route(args) => run_route_command(config, args).await,
        Commands::Check(args) => run_check_command(args),
        Commands::History(args) => run_history_command(config, args).await,
        Commands::Metrics => {
            print!("{}", export_metrics());
            Ok(())
        }
    }
}

fn apply_ask_overrides(mut config: PipelineConfig, args: &AskArgs) -> PipelineConfig {
    if let Some(model) = &args.model {
        config = config.with_model(model.clone());
    }
    if let Some(retries) = args.max_retries {
        config = config.with_max_retries(retries);
    }
    if let Some(passages) = &args.passages {
        config = config.with_passages_path(passages.clone());
    }
    if let Some(output) = &args.output {
        config = config.with_output_dir(output.clone());
    }
    if args.no_fallback {
        config = config.with_llm_fallback(false);
    }
    config
}

async fn run_ask_command(config: PipelineConfig, args: AskArgs) -> anyhow::Result<()> {
    let config = apply_ask_overrides(config, &args);
    let orchestrator = PipelineOrchestrator::from_config(config)
        .await
        .context("Failed to initialize pipeline")?;

    let mut request = InstructionRequest::new(args.instruction.clone());
    request.input_file = args.input.clone();
    request.workbook = args.workbook.clone();
    request.conversation_id = args.conversation.clone();

    let reply = orchestrator.handle(request).await?;
    info!(
        conversation = %reply.conversation_id,
        success = reply.succeeded(),
        "Instruction handled"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reply)?);
    } else {
        print_reply(&reply);
    }
    if args.metrics {
        print!("{}", export_metrics());
    }

    if reply.succeeded() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "{}",
            reply.error.clone().unwrap_or_else(|| reply.reply.clone())
        ))
    }
}

fn print_reply(reply: &OrchestratorReply) {
    println!("Conversation: {}", reply.conversation_id);
    println!(
        "Path:         {} ({}: {})",
        reply.path,
        reply.routing_source.as_str(),
        reply.routing_reason
    );

    if let Some(result) = &reply.result {
        println!();
        for line in &result.logs {
            println!("  {}", line);
        }
        if !result.final_code.is_empty() {
            println!("\nFinal code:\n{}", result.final_code);
        }
    }

    println!("\n{}", reply.reply);
    if !reply.sources.is_empty() {
        println!("\nSources: {}", reply.sources.join(", "));
    }
    if let Some(error) = &reply.error {
        println!("\nCause: {}", error);
    }
}

#[derive(Debug, Serialize)]
struct RouteOutput<'a> {
    instruction: &'a str,
    #[serde(flatten)]
    decision: crate::routing::RoutingDecision,
}

async fn run_route_command(config: PipelineConfig, args: RouteArgs) -> anyhow::Result<()> {
    let router = if args.no_fallback || !config.use_llm_fallback {
        IntentRouter::rules_only()
    } else {
        match LiteLlmClient::from_env() {
            Ok(client) => IntentRouter::with_fallback(
                Oracle::new(Arc::new(client), config.model.clone(), config.oracle_timeout)
                    .with_temperature(config.temperature),
            ),
            Err(e) => {
                warn!(error = %e, "No LLM configured, routing with rules only");
                IntentRouter::rules_only()
            }
        }
    };

    let decision = router.route(&args.instruction).await;
    if args.json {
        let output = RouteOutput {
            instruction: &args.instruction,
            decision,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "{} ({}): {}",
            decision.path,
            decision.source.as_str(),
            decision.reason
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    violation: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    injected_imports: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

fn check_code(code: &str) -> CheckOutput {
    match SafetyValidator::new().validate(code) {
        Ok(validated) => CheckOutput {
            passed: true,
            violation: None,
            injected_imports: validated.injected_imports,
            code: Some(validated.code),
        },
        Err(violation) => CheckOutput {
            passed: false,
            violation: Some(violation.to_string()),
            injected_imports: Vec::new(),
            code: None,
        },
    }
}

fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let code = read_code_file(&args.code_file)?;
    let output = check_code(&code);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if output.passed {
        for import in &output.injected_imports {
            println!("Auto-added: {}", import);
        }
        println!("Passed.");
    } else if let Some(violation) = &output.violation {
        println!("Rejected: {}", violation);
    }

    if output.passed {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Code rejected by the safety check"))
    }
}

fn read_code_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read code file {}", path.display()))
}

async fn run_history_command(config: PipelineConfig, args: HistoryArgs) -> anyhow::Result<()> {
    let db = args.db.unwrap_or(config.history_db);
    if !db.exists() {
        return Err(anyhow::anyhow!(
            "History database does not exist: {}",
            db.display()
        ));
    }

    let store = ConversationStore::open(&db).await?;
    let turns = store.fetch(&args.conversation_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&turns)?);
        return Ok(());
    }

    if turns.is_empty() {
        println!("No turns recorded for {}", args.conversation_id);
        return Ok(());
    }
    for turn in &turns {
        println!(
            "[{}] #{} {} ({})",
            turn.timestamp.format("%Y-%m-%d %H:%M:%S"),
            turn.turn_id,
            turn.mode,
            turn.reason
        );
        println!("  > {}", turn.query);
        println!("  {}", turn.response);
        if let Some(file) = &turn.output_file_name {
            println!("  output: {}", file);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ask_command_defaults() {
        let cli = Cli::try_parse_from(["peach", "ask", "double inv_cost"]).expect("should parse");
        assert_eq!(cli.log_level, "info");

        match cli.command {
            Commands::Ask(args) => {
                assert_eq!(args.instruction, "double inv_cost");
                assert!(args.input.is_none());
                assert!(args.workbook.is_none());
                assert!(args.conversation.is_none());
                assert!(!args.no_fallback);
                assert!(!args.json);
            }
            _ => panic!("Expected Ask command"),
        }
    }

    #[test]
    fn test_ask_command_with_all_options() {
        let cli = Cli::try_parse_from([
            "peach",
            "ask",
            "increase inv_cost by 10%",
            "-i",
            "data/costs.parquet",
            "--conversation",
            "1a2b3c4d-5e6f",
            "-m",
            "gpt-4o",
            "--max-retries",
            "1",
            "-o",
            "out",
            "--no-fallback",
            "-j",
            "--log-level",
            "debug",
        ])
        .expect("should parse");
        assert_eq!(cli.log_level, "debug");

        match cli.command {
            Commands::Ask(args) => {
                assert_eq!(args.input, Some(PathBuf::from("data/costs.parquet")));
                assert_eq!(args.conversation.as_deref(), Some("1a2b3c4d-5e6f"));
                assert!(args.json);

                let config = apply_ask_overrides(PipelineConfig::default(), &args);
                assert_eq!(config.model, "gpt-4o");
                assert_eq!(config.max_retries, 1);
                assert_eq!(config.output_dir, PathBuf::from("out"));
                assert!(!config.use_llm_fallback);
            }
            _ => panic!("Expected Ask command"),
        }
    }

    #[test]
    fn test_other_commands_parse() {
        assert!(matches!(
            Cli::try_parse_from(["peach", "route", "what is inv_cost?", "--no-fallback"])
                .expect("should parse")
                .command,
            Commands::Route(RouteArgs { no_fallback: true, .. })
        ));
        assert!(matches!(
            Cli::try_parse_from(["peach", "check", "code.py"]).expect("should parse").command,
            Commands::Check(_)
        ));
        assert!(matches!(
            Cli::try_parse_from(["peach", "history", "abc"]).expect("should parse").command,
            Commands::History(_)
        ));
        assert!(matches!(
            Cli::try_parse_from(["peach", "metrics"]).expect("should parse").command,
            Commands::Metrics
        ));
        assert!(Cli::try_parse_from(["peach", "ask"]).is_err());
    }

    #[test]
    fn test_check_code_reports_violation() {
        let rejected = check_code("import os\nos.remove('x')");
        assert!(!rejected.passed);
        assert!(rejected.violation.is_some());

        let passed = check_code("df.loc[:, 'a'] = 1");
        assert!(passed.passed);
        assert_eq!(
            passed.injected_imports,
            vec!["import pandas as pd", "import numpy as np"]
        );
    }
}
