//! CLI module for the groundwork binary.
//!
//! This module provides the command-line interface wrapping the engine's
//! plan, apply, destroy and drift operations.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
