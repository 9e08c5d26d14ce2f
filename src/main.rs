mod catalog;
mod cli;
mod commands;
mod config;
mod daemon;
mod errors;
mod ipc;
mod lifecycle;
mod logging;
mod platform;
mod probe;
mod registry;
mod status;
mod surface;
#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, DaemonCommand};
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command {
        Commands::Daemon {
            command: DaemonCommand::Run,
        } => daemon::run_foreground(config).await,
        command => commands::run(command, &config).await,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
