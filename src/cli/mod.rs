//! CLI interface using clap
//!
//! Provides the command-line interface for the theme evolution engine

mod commands;

pub use commands::*;

use clap::{Parser, Subcommand};

/// Incremental theme evolution over survey response batches
#[derive(Parser, Debug)]
#[command(name = "thematic")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the catalog database
    #[arg(short, long, global = true, default_value = "thematic.db")]
    pub db: String,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "thematic.toml")]
    pub config: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process batches of survey responses from a JSON file
    Process(ProcessArgs),

    /// Show catalog statistics
    Stats,

    /// Probe the store and the LLM backends
    Health,

    /// Print the effective configuration
    Config,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Arguments for the process command
#[derive(Parser, Debug)]
pub struct ProcessArgs {
    /// JSON file with an array of {batch_id, question, responses} objects
    pub input: String,

    /// Keep processing later batches after a batch fails
    #[arg(long)]
    pub continue_on_error: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_process_command() {
        let cli = Cli::parse_from(["thematic", "process", "batches.json", "--continue-on-error"]);
        match cli.command {
            Commands::Process(args) => {
                assert_eq!(args.input, "batches.json");
                assert!(args.continue_on_error);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_apply_everywhere() {
        let cli = Cli::parse_from(["thematic", "--db", "x.db", "-o", "json", "stats"]);
        assert_eq!(cli.db, "x.db");
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Stats));
    }
}
