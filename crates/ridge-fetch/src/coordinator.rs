//! Whole-file downloads: catalog fetch, part planning, and reconstruction.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use ridge_core::config::RidgeConfig;
use ridge_core::wire::{Packet, RECV_BUFFER_SIZE};
use ridge_services::{FileProgress, SharedProgress, TransferError};

use crate::display::{self, ProgressView};
use crate::part::{bind_for, send, PartDownload};
use crate::plan::plan_parts;

#[derive(Clone)]
pub struct Client {
    config: RidgeConfig,
    quiet: bool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Client {
    pub fn new(config: RidgeConfig, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            config,
            quiet: false,
            shutdown_tx,
        }
    }

    /// Suppress the progress renderer.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.config.client.server
    }

    pub fn config(&self) -> &RidgeConfig {
        &self.config
    }

    /// Ask the server for its catalog. Retried like any other request.
    pub async fn fetch_catalog(&self) -> Result<BTreeMap<String, u64>> {
        let server = self.server();
        let socket = bind_for(server)
            .await
            .context("failed to bind catalog socket")?;
        let client_port = socket.local_addr()?.port();
        let request = Packet::List {
            files: None,
            client_port: Some(client_port),
        };

        let attempts = self.config.transfer.max_retries + 1;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        for attempt in 1..=attempts {
            send(&socket, server, &request).await?;
            let deadline = tokio::time::Instant::now() + self.config.transfer.ack_timeout();

            while let Ok(received) =
                tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
            {
                let (len, from) = received.context("catalog receive failed")?;
                if from != server {
                    continue;
                }
                match Packet::decode(&buf[..len]) {
                    Ok(Packet::List { files: Some(files), .. }) => {
                        tracing::debug!(%server, files = files.len(), "catalog received");
                        return Ok(files);
                    }
                    Ok(other) => tracing::debug!(kind = ?other.kind(), "unexpected reply to LIST"),
                    Err(e) => tracing::debug!(error = %e, "dropping malformed datagram"),
                }
            }
            tracing::debug!(%server, attempt, "no catalog reply");
        }
        bail!("no catalog reply from {server} after {attempts} attempts")
    }

    /// Download `name` (`size` bytes, as listed by the server) into the
    /// output directory. The file only appears under its real name once
    /// every part has succeeded and the parts wrote exactly `size` bytes.
    pub async fn download_file(&self, name: &str, size: u64) -> Result<PathBuf, TransferError> {
        let output_dir = &self.config.client.output_dir;
        tokio::fs::create_dir_all(output_dir).await?;
        let dest = output_dir.join(name);
        let partial = output_dir.join(format!("{name}.part"));

        let result = self.download_into(name, size, &partial).await;
        match result {
            Ok(()) => {
                tokio::fs::rename(&partial, &dest).await?;
                Ok(dest)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn download_into(&self, name: &str, size: u64, partial: &Path) -> Result<(), TransferError> {
        let file = tokio::fs::File::create(partial).await?;
        file.set_len(size).await?;
        drop(file);

        let plans = plan_parts(size, self.config.client.max_parts);
        let progress: SharedProgress = FileProgress::new(name, size);
        for plan in &plans {
            progress.register(plan.index, plan.length).await;
        }

        tracing::info!(file = name, size, parts = plans.len(), "download starting");

        let view = if self.quiet || plans.is_empty() {
            None
        } else {
            Some(ProgressView::new(&progress.snapshot().await))
        };
        let renderer = view.clone().map(|view| {
            tokio::spawn(display::render_loop(progress.clone(), view, self.shutdown_tx.subscribe()))
        });

        let mut parts = JoinSet::new();
        for plan in plans {
            let part = PartDownload {
                server: self.server(),
                file_name: name.to_string(),
                plan,
                dest: partial.to_path_buf(),
                transfer: self.config.transfer.clone(),
                progress: progress.clone(),
            };
            let shutdown = self.shutdown_tx.subscribe();
            parts.spawn(async move { (plan.index, part.run(shutdown).await) });
        }

        let mut first_error = None;
        let mut written = 0u64;
        while let Some(joined) = parts.join_next().await {
            let (index, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    first_error.get_or_insert(TransferError::Aborted(format!("part task failed: {e}")));
                    continue;
                }
            };
            match result {
                Ok(bytes) => written += bytes,
                Err(e) => {
                    tracing::warn!(file = name, part = index, error = %e, "part failed");
                    progress.mark_failed(index).await;
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(renderer) = renderer {
            renderer.abort();
        }
        if let Some(view) = view {
            view.finish(&progress.snapshot().await);
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        if written != size {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("parts wrote {written} bytes, expected {size}"),
            )));
        }
        Ok(())
    }
}
