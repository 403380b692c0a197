//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stackweave - cross-stack dependency resolution and convergence.
#[derive(Parser, Debug)]
#[command(name = "stackweave")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STACKWEAVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Restrict the command to these stacks (repeatable or comma separated).
    #[arg(short, long = "stack", global = true, value_delimiter = ',')]
    pub stacks: Vec<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the project configuration and stack graphs.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what `up` would change, without applying.
    Preview {
        /// Show the inputs each action is still waiting on.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Converge the selected stacks to their declared state.
    Up {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum concurrent provider operations per stack.
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Delete every resource of the selected stacks.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the published outputs of a stack.
    Outputs {
        /// Stack name.
        stack: String,
    },

    /// Inspect and manage stored state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the stored records of a stack.
    Show {
        /// Stack name.
        stack: String,
    },

    /// Take the advisory lock on a stack.
    Lock {
        /// Stack name.
        stack: String,

        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Release the advisory lock on a stack.
    Unlock {
        /// Stack name.
        stack: String,

        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Release whatever lock is held (dangerous).
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
