//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: drive a task through the iteration engine
//! - check: probe backend availability

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// agentloop - drive an autonomous agent through bounded iteration loops
#[derive(Parser, Debug)]
#[command(name = "agentloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a task through the iteration engine
    Run {
        /// Instruction handed to the backend each iteration
        instruction: String,

        /// Backend to use (subprocess, protocol)
        #[arg(short, long, default_value = "subprocess")]
        backend: String,

        /// Iteration cap (omit for the default of 10)
        #[arg(short, long)]
        iterations: Option<u32>,

        /// Iterate without a cap until the task completes
        #[arg(long, conflicts_with = "iterations")]
        unlimited: bool,

        /// Model hint passed through to the backend
        #[arg(short, long)]
        model: Option<String>,

        /// Named subagent the backend should delegate to
        #[arg(short, long)]
        subagent: Option<String>,

        /// Working directory for backend calls
        #[arg(short, long)]
        working_dir: Option<PathBuf>,

        /// Treat this substring in result content as task completion
        #[arg(long)]
        completion_marker: Option<String>,
    },

    /// Probe whether a backend is available
    Check {
        /// Backend to probe (subprocess, protocol)
        #[arg(default_value = "subprocess")]
        backend: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_parsing() {
        let cli = Cli::parse_from([
            "agentloop",
            "run",
            "fix the tests",
            "--backend",
            "protocol",
            "--iterations",
            "5",
            "--model",
            "sonnet",
        ]);

        match cli.command {
            Commands::Run {
                instruction,
                backend,
                iterations,
                unlimited,
                model,
                ..
            } => {
                assert_eq!(instruction, "fix the tests");
                assert_eq!(backend, "protocol");
                assert_eq!(iterations, Some(5));
                assert!(!unlimited);
                assert_eq!(model.as_deref(), Some("sonnet"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["agentloop", "run", "do it"]);
        match cli.command {
            Commands::Run {
                backend, iterations, ..
            } => {
                assert_eq!(backend, "subprocess");
                assert!(iterations.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unlimited_conflicts_with_iterations() {
        let result = Cli::try_parse_from([
            "agentloop",
            "run",
            "task",
            "--unlimited",
            "--iterations",
            "3",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_check_command_parsing() {
        let cli = Cli::parse_from(["agentloop", "check", "protocol"]);
        match cli.command {
            Commands::Check { backend } => assert_eq!(backend, "protocol"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["agentloop", "--verbose", "check"]);
        assert!(cli.is_verbose());
        assert!(cli.config.is_none());
    }
}
