//! ridged: serves the files named in a catalog over reliable UDP.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use ridge_core::config::RidgeConfig;
use ridge_services::Catalog;
use ridged::Server;

/// Reliable-UDP file server.
#[derive(Debug, Parser)]
#[command(name = "ridged", version, about = "ridge file server")]
struct Cli {
    /// Config file (defaults to $RIDGE_CONFIG or ~/.config/ridge/config.toml)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short = 'b', long = "bind")]
    bind: Option<SocketAddr>,

    /// Catalog file listing `name size` entries
    #[arg(long = "catalog", value_name = "FILE")]
    catalog: Option<PathBuf>,

    /// Directory holding the catalog's files
    #[arg(long = "files-dir", value_name = "DIR")]
    files_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
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
        None => {
            if let Err(e) = RidgeConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            RidgeConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                RidgeConfig::default()
            })
        }
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(catalog) = cli.catalog {
        config.server.catalog_path = catalog;
    }
    if let Some(files_dir) = cli.files_dir {
        config.server.files_dir = files_dir;
    }

    tracing::info!(
        bind = %config.server.bind,
        catalog = %config.server.catalog_path.display(),
        files_dir = %config.server.files_dir.display(),
        chunk_size = config.transfer.chunk_size,
        "ridged starting"
    );

    let catalog = Catalog::load(&config.server.catalog_path, &config.server.files_dir)?;
    let server = Server::bind(config, catalog).await?;

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

    server.run(shutdown_tx).await
}
