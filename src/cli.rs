use clap::{Parser, Subcommand};

const BUILD_VERSION: &str = env!("SVCMGR_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

COMMANDS:
{subcommands}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Quick Command Map
  Runtime:
    list/ls/ps, status
  Lifecycle:
    start, stop, restart/rs
  Config:
    check
  Platform:
    daemon

Compatibility Aliases
  list    -> ls, ps
  restart -> rs

Examples
  svcmgr ps
  svcmgr start crawler
  svcmgr stop ai --force
  svcmgr rs gateway --operator ops
";

#[derive(Debug, Parser)]
#[command(
    name = "svcmgr",
    version = BUILD_VERSION,
    about = "Lifecycle manager for sibling services",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show every catalog service with its live state
    #[command(visible_alias = "ls", visible_alias = "ps")]
    List,
    /// Show one service in detail
    Status { name: String },
    /// Start a service and wait for its port to come up
    Start { name: String },
    /// Stop a service and confirm its port is released
    Stop {
        name: String,
        /// Kill the service when it ignores the graceful stop
        #[arg(long)]
        force: bool,
        /// Who asked for the stop; recorded in the daemon log
        #[arg(long)]
        operator: Option<String>,
    },
    /// Stop then start a service
    #[command(visible_alias = "rs")]
    Restart {
        name: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        operator: Option<String>,
    },
    /// Validate the service catalog without contacting the daemon
    Check,
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    Run,
    Stop,
}
