//! CLI entry point: loads config, brings up an in-process `Orchestrator`
//! over `MemoryStateStore`, runs one command, and tears the orchestrator
//! back down.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use clusterd::adapters::MemoryStateStore;
use clusterd::cli::{commands, Cli, Commands};
use clusterd::infrastructure::{config::ConfigLoader, logging};
use clusterd::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load().context("failed to load configuration")?;
    logging::init(&config.logging).context("failed to initialize logging")?;

    let store = Arc::new(MemoryStateStore::new());
    let orchestrator = Orchestrator::new(config, store).await;
    orchestrator.start().await;

    let result = match cli.command {
        Commands::Job(cmd) => commands::handle_job(&orchestrator, cmd, cli.json).await,
        Commands::Node(cmd) => commands::handle_node(&orchestrator, cmd, cli.json).await,
        Commands::Deployment(cmd) => commands::handle_deployment(&orchestrator, cmd, cli.json).await,
        Commands::Eval(cmd) => commands::handle_eval(&orchestrator, cmd, cli.json).await,
    };

    orchestrator.shutdown().await;
    result
}
