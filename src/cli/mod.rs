//! Command-line interface for peach.
//!
//! Provides commands for handling instructions, inspecting routing and
//! safety decisions, and reading conversation history.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
