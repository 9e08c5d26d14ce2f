mod check;
mod common;
mod daemon_stop;
mod list;
mod restart;
mod start;
mod status;
mod stop;

use anyhow::Result;

use crate::cli::{Commands, DaemonCommand};
use crate::config::AppConfig;

pub async fn run(command: Commands, config: &AppConfig) -> Result<()> {
    let needs_daemon = !matches!(
        command,
        Commands::Check
            | Commands::Daemon {
                command: DaemonCommand::Stop,
            }
    );

    if needs_daemon {
        crate::daemon::ensure_daemon_running(config).await?;
    }

    match command {
        Commands::List => list::run(config).await,
        Commands::Status { name } => status::run(config, name).await,
        Commands::Start { name } => start::run(config, name).await,
        Commands::Stop {
            name,
            force,
            operator,
        } => stop::run(config, name, force, operator).await,
        Commands::Restart {
            name,
            force,
            operator,
        } => restart::run(config, name, force, operator).await,
        Commands::Check => check::run(config),
        Commands::Daemon {
            command: DaemonCommand::Run,
        } => unreachable!("daemon mode is handled before CLI dispatch"),
        Commands::Daemon {
            command: DaemonCommand::Stop,
        } => daemon_stop::run(config).await,
    }
}
