//! Instruction handling from routing to reply.
//!
//! # Architecture
//!
//! - **Orchestrator**: routes an instruction and drives the chosen path
//! - **Assembler**: turns an edit run into a [`PipelineResult`]
//! - **Knowledge**: answers information requests from retrieved passages
//! - **Config**: configuration for all pipeline components
//!
//! # Flow
//!
//! 1. **Routing**: rule stage, then optional model fallback for questions
//! 2. **Resolution**: supplied file, or sheet lookup in the workbook
//! 3. **Transformation**: synthesize, validate, execute, retry with feedback
//! 4. **Assembly**: logs, final code and output artifact
//! 5. **History**: the turn is appended to the conversation store
//!
//! # Example
//!
//! ```rust,ignore
//! use peach::pipeline::{InstructionRequest, PipelineConfig, PipelineOrchestrator};
//!
//! let config = PipelineConfig::from_env()?.with_default_workbook("data/scenario.json");
//! let orchestrator = PipelineOrchestrator::from_config(config).await?;
//!
//! let reply = orchestrator
//!     .handle(InstructionRequest::new("increase inv_cost by 10% for solar"))
//!     .await?;
//! println!("{}", reply.reply);
//! ```

pub mod assembler;
pub mod config;
pub mod knowledge;
pub mod orchestrator;

pub use assembler::{assemble, PipelineResult};
pub use config::{ConfigError, PipelineConfig};
pub use knowledge::{KnowledgeAnswer, KnowledgeResponder};
pub use orchestrator::{
    artifact_path, InstructionRequest, OrchestratorReply, PipelineOrchestrator, PipelineStats,
};
