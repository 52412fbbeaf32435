// Sweepflow CLI
// Run, validate and inspect swept workflow definitions

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

/// Run swept, cached data-processing workflows
#[derive(Parser, Debug)]
#[command(name = "sweepflow", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute every instance of a workflow
    Run(commands::run::RunArgs),

    /// Check a workflow file without running it
    Validate(commands::validate::ValidateArgs),

    /// List the instances a workflow's sweeps expand to
    Expand(commands::expand::ExpandArgs),

    /// Inspect or clear the result cache
    Cache(commands::cache::CacheArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // SWEEPFLOW_LOG takes the usual EnvFilter directives, e.g. "sweepflow_engine=debug"
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SWEEPFLOW_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Expand(args) => commands::expand::execute(args),
        Commands::Cache(args) => commands::cache::execute(args).await,
    }
}
