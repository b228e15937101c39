//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ConfigOverrides;

/// Podlease - lease a disposable `RunPod` GPU pod and tunnel to it.
#[derive(Parser, Debug)]
#[command(name = "podlease")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the `.env` file.
    #[arg(short, long, global = true, env = "PODLEASE_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

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
    /// Write a `.env` file with the API key and defaults.
    Init {
        /// `RunPod` API key.
        #[arg(long, env = "RUNPOD_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,

        /// Check the key against the API before writing.
        #[arg(long)]
        verify: bool,

        /// SSH password to set on pods; each run generates one when omitted.
        #[arg(long)]
        ssh_password: Option<String>,

        /// Minimum VRAM in GB.
        #[arg(long)]
        min_vram: Option<u32>,

        /// Hourly on-demand cost ceiling in USD.
        #[arg(long)]
        max_cost: Option<f64>,

        /// Container image.
        #[arg(long)]
        image: Option<String>,

        /// Container disk in GB.
        #[arg(long)]
        disk: Option<u32>,
    },

    /// List GPU offerings that satisfy the configured limits.
    Offerings {
        /// Price the interruptible market.
        #[arg(long)]
        spot: bool,
    },

    /// Lease a pod, open tunnels, and terminate it on exit.
    Deploy {
        /// Use the interruptible market.
        #[arg(long)]
        spot: bool,

        /// Per-run limits.
        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Terminate every running pod created by this tool.
    Stop,
}

/// Per-run overrides of the configured limits.
#[derive(clap::Args, Debug, Default)]
pub struct OverrideArgs {
    /// Container image.
    #[arg(long)]
    pub image: Option<String>,

    /// Minimum VRAM in GB.
    #[arg(long)]
    pub min_vram: Option<u32>,

    /// Hourly cost ceiling in USD.
    #[arg(long)]
    pub max_cost: Option<f64>,
}

impl From<OverrideArgs> for ConfigOverrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            docker_image: args.image,
            min_vram_gb: args.min_vram,
            max_cost_per_hour: args.max_cost,
        }
    }
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

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_deploy_flags() {
        let cli = Cli::try_parse_from([
            "podlease", "deploy", "--spot", "--min-vram", "24", "--image", "img:1", "-v",
        ])
        .expect("parses");

        assert!(cli.verbose);
        let Commands::Deploy { spot, overrides } = cli.command else {
            panic!("expected deploy");
        };
        assert!(spot);
        let overrides = ConfigOverrides::from(overrides);
        assert_eq!(overrides.min_vram_gb, Some(24));
        assert_eq!(overrides.docker_image.as_deref(), Some("img:1"));
        assert_eq!(overrides.max_cost_per_hour, None);
    }

    #[test]
    fn test_json_output_flag() {
        let cli = Cli::try_parse_from(["podlease", "--output", "json", "stop"]).expect("parses");
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Stop));
    }
}
