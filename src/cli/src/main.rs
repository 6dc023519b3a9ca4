//! ingestctl - Operator CLI for ingestion jobs.
//!
//! Inspects, dispatches and cancels jobs and works the dead letter queue
//! directly against the job database.

mod commands;
mod context;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{dlq, jobs, migrate};
use context::Context;
use output::OutputFormat;

/// ingestctl - Ingestion job orchestration CLI
#[derive(Parser)]
#[command(
    name = "ingestctl",
    version,
    about = "Ingestion job orchestration CLI",
    long_about = "Operator tool for inspecting and managing tenant ingestion jobs and the dead letter queue.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Config file (defaults to ./ingest.* plus INGEST__ environment variables)
    #[arg(short, long, global = true, env = "INGEST_CONFIG")]
    config: Option<String>,

    /// Database URL, overriding the configured one
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingestion job operations
    #[command(subcommand)]
    Jobs(jobs::JobsCommands),

    /// Dead letter queue operations
    #[command(subcommand)]
    Dlq(dlq::DlqCommands),

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = Context::connect(cli.config.as_deref(), cli.database_url).await?;
    let format = cli.output;

    match cli.command {
        Commands::Jobs(cmd) => jobs::execute(cmd, &ctx, format).await,
        Commands::Dlq(cmd) => dlq::execute(cmd, &ctx, format).await,
        Commands::Migrate => migrate::execute(&ctx, format).await,
    }
}
