//! CLI module for podlease.
//!
//! This module provides the command-line interface for leasing
//! `RunPod` pods.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, OverrideArgs};
pub use output::OutputFormatter;
