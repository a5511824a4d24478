//! Command-line interface for stage-forge.
//!
//! Provides commands for running the engine, submitting and inspecting
//! tasks, and one-off peer-review passes.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
