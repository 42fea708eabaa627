//! thematic - Theme evolution engine for survey responses
//!
//! Processes ordered batches of free-text survey responses into a living,
//! evolving theme catalog backed by a local LLM.

use anyhow::Result;
use std::path::Path;
use thematic::cli::{health, process, show_config, stats, Cli, Commands};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let db_path = Path::new(&cli.db);
    let config_path = Path::new(&cli.config);

    // Execute command
    match cli.command {
        Commands::Process(args) => {
            process(
                db_path,
                config_path,
                Path::new(&args.input),
                args.continue_on_error,
                cli.format,
            )?;
        }

        Commands::Stats => {
            stats(db_path, cli.format)?;
        }

        Commands::Health => {
            health(db_path, config_path, cli.format)?;
        }

        Commands::Config => {
            show_config(config_path)?;
        }
    }

    Ok(())
}
