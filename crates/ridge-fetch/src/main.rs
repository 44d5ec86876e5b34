//! ridge-fetch: downloads files from a ridge server over reliable UDP.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use ridge_core::config::RidgeConfig;
use ridge_fetch::Client;

mod cmd;

/// Parallel reliable-UDP download client.
#[derive(Debug, Parser)]
#[command(name = "ridge-fetch", version, about = "ridge download client")]
struct Cli {
    /// Config file (defaults to $RIDGE_CONFIG or ~/.config/ridge/config.toml)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Server address
    #[arg(short = 's', long = "server", global = true)]
    server: Option<SocketAddr>,

    /// Directory downloads are written to
    #[arg(short = 'o', long = "output-dir", value_name = "DIR", global = true)]
    output_dir: Option<PathBuf>,

    /// Parallel parts per file (1-4)
    #[arg(short = 'p', long = "parts", global = true)]
    parts: Option<usize>,

    /// Do not print progress
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the server's catalog
    List,
    /// Download the named files once
    Get {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Follow the input file and download new names as they appear (default)
    Watch {
        /// Input file, one name per line
        #[arg(short = 'i', long = "input", value_name = "FILE")]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => RidgeConfig::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RidgeConfig::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            RidgeConfig::default()
        }),
    };
    if let Some(server) = cli.server {
        config.client.server = server;
    }
    if let Some(dir) = cli.output_dir {
        config.client.output_dir = dir;
    }
    if let Some(parts) = cli.parts {
        config.client.max_parts = parts;
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let client = Client::new(config.clone(), shutdown_tx.clone()).quiet(cli.quiet);

    match cli.command {
        Some(Command::List) => cmd::files::cmd_list(&client).await,
        Some(Command::Get { names }) => cmd::files::cmd_get(&client, &names).await,
        Some(Command::Watch { input }) => {
            let input = input.unwrap_or_else(|| config.client.input_file.clone());
            cmd::watch::cmd_watch(client, input, shutdown_tx.subscribe()).await
        }
        None => cmd::watch::cmd_watch(client, config.client.input_file.clone(), shutdown_tx.subscribe()).await,
    }
}
