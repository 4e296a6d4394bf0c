//! toolmux: per-session supervisor for stdio tool servers.

mod serve;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use toolmux_config::{CliOverrides, ToolmuxConfig};
use toolmux_session::{ProcessClientFactory, Supervisor};

#[derive(Parser)]
#[command(
    name = "toolmux",
    version,
    about = "Per-session supervisor for stdio tool servers"
)]
struct Cli {
    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Read settings from this file instead of ~/.toolmux/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read JSON commands on stdin and write session events on stdout
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Tool server executable (overrides TOOLMUX_SERVER_COMMAND)
    #[arg(long)]
    server_command: Option<String>,

    /// Reclaim sessions idle for this many seconds with no connections
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Arguments passed to the tool server
    #[arg(last = true)]
    server_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; stdout carries protocol output only
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => {
            let config = ToolmuxConfig::load(CliOverrides {
                server_command: args.server_command,
                server_args: args.server_args,
                idle_timeout_secs: args.idle_timeout_secs,
                config_path: cli.config,
            })
            .context("Failed to load configuration")?;

            tokio::fs::create_dir_all(&config.root_dir)
                .await
                .with_context(|| format!("Failed to create {}", config.root_dir.display()))?;

            tracing::info!(
                "Serving '{}' with sessions under {}",
                config.server_command,
                config.root_dir.display()
            );
            let factory = Arc::new(ProcessClientFactory::new(config.server_config()));
            let supervisor = Arc::new(Supervisor::new(config.supervisor_config(), factory));
            serve::run(supervisor).await
        }
    }
}
