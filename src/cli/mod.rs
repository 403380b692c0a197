//! CLI module for stackweave.
//!
//! This module provides the command-line interface for previewing,
//! applying and destroying stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
