//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// groundwork - declarative resource reconciliation.
#[derive(Parser, Debug)]
#[command(name = "groundwork")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the specification file.
    #[arg(short = 'f', long, global = true, env = "GROUNDWORK_SPEC")]
    pub spec: Option<PathBuf>,

    /// Target environment (overrides `project.environment`).
    #[arg(short, long, global = true)]
    pub environment: Option<String>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the specification and build its dependency graph.
    Validate {
        /// Show warnings as well as errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the execution plan.
    Plan {
        /// Save the plan to a file for a later `apply --plan`.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Apply changes to converge the environment.
    Apply {
        /// Apply a previously saved plan instead of planning again.
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Destroy every resource recorded for the environment.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Compare recorded state with what providers report.
    Drift,

    /// Manage the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the current state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Release whatever lock is held.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply_with_saved_plan() {
        let cli = Cli::try_parse_from([
            "groundwork",
            "-f",
            "stack.yaml",
            "--environment",
            "prod",
            "apply",
            "--plan",
            "plan.json",
            "-y",
        ])
        .expect("parse");

        assert_eq!(cli.spec, Some(PathBuf::from("stack.yaml")));
        assert_eq!(cli.environment.as_deref(), Some("prod"));
        assert!(matches!(
            cli.command,
            Commands::Apply { plan: Some(ref p), yes: true } if p == &PathBuf::from("plan.json")
        ));
    }

    #[test]
    fn test_parse_state_unlock() {
        let cli = Cli::try_parse_from(["groundwork", "--output", "json", "state", "unlock", "--force"])
            .expect("parse");
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { lock_id: None, force: true }
            }
        ));
    }
}
