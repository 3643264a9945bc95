//! kvplayd — runs a local kvplay cluster.
//!
//! Loads a `cluster.toml`, launches every member as a child process,
//! forwards the shared log stream to the daemon log, and tears the
//! cluster down on Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! kvplayd bootstrap --config cluster.toml --plain
//! kvplayd validate --config cluster.toml
//! ```

mod bootstrap;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kvplayd", about = "kvplay cluster daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every member, wait for Ctrl-C, then terminate and clean them.
    Bootstrap {
        /// Cluster config file.
        #[arg(long, default_value = "cluster.toml")]
        config: PathBuf,

        /// Emit process output without HTML color tags.
        #[arg(long)]
        plain: bool,

        /// Restart a fully stopped cluster every N seconds.
        #[arg(long)]
        revive_interval: Option<u64>,
    },

    /// Check a cluster config and print each member's arguments.
    Validate {
        /// Cluster config file.
        #[arg(long, default_value = "cluster.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kvplayd=debug,kvplay=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Bootstrap {
            config,
            plain,
            revive_interval,
        } => bootstrap::run_bootstrap(config, plain, revive_interval).await,
        Command::Validate { config } => bootstrap::run_validate(config),
    }
}
