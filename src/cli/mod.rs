//! CLI module for agentloop - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
