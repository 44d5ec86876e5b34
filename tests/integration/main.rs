//! ridge integration test harness.
//!
//! Every test runs a real server and client in-process over loopback UDP,
//! each in its own temp directory. Loss is injected with the relay in
//! `fault.rs`, which sits between client and server.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use ridge_core::config::RidgeConfig;
use ridge_fetch::Client;
use ridge_services::{Catalog, SharedState, TransferSnapshot};
use ridged::Server;

mod failures;
mod fault;
mod files;

// ── Temp directories ──────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp directory removed on drop, also when the test panics.
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new(name: &str) -> Self {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "ridge-it-{name}-{}-{id}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).expect("create test dir");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Config tuned for loopback: small chunks and short timeouts.
pub fn test_config(dir: &Path) -> RidgeConfig {
    let mut config = RidgeConfig::default();
    config.server.bind = "127.0.0.1:0".parse().unwrap();
    config.server.catalog_path = dir.join("file_list.txt");
    config.server.files_dir = dir.join("server_files");
    config.client.output_dir = dir.join("downloads");
    config.client.input_file = dir.join("input.txt");
    config.transfer.chunk_size = 4 * 1024;
    config.transfer.ack_timeout_ms = 100;
    config.transfer.max_retries = 8;
    config.transfer.receive_timeout_ms = 500;
    config.transfer.max_receive_timeouts = 10;
    config.transfer.end_linger_ms = 200;
    config
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: SharedState,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl TestServer {
    /// Write `files` into the server directory, list them in the catalog,
    /// and start serving.
    pub async fn start(config: &RidgeConfig, files: &[(&str, &[u8])]) -> Result<Self> {
        std::fs::create_dir_all(&config.server.files_dir)?;
        let mut listing = String::new();
        for (name, contents) in files {
            std::fs::write(config.server.files_dir.join(name), contents)?;
            listing.push_str(&format!("{name} {}\n", contents.len()));
        }
        std::fs::write(&config.server.catalog_path, listing)?;

        let catalog = Catalog::load(&config.server.catalog_path, &config.server.files_dir)?;
        let server = Server::bind(config.clone(), catalog).await?;
        let addr = server.local_addr()?;
        let state = server.state();

        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(server.run(shutdown_tx.clone()));

        Ok(Self {
            addr,
            state,
            shutdown_tx,
            handle: Some(handle),
        })
    }

    pub async fn snapshot(&self) -> Vec<TransferSnapshot> {
        self.state.lock().await.snapshot()
    }

    /// Poll the transfer table until `done` holds or `timeout` passes.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        done: impl Fn(&[TransferSnapshot]) -> bool,
    ) -> Vec<TransferSnapshot> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snap = self.snapshot().await;
            if done(&snap) || tokio::time::Instant::now() >= deadline {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            handle.await.context("server task panicked")??;
        }
        Ok(())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// A quiet client pointed at `server`.
pub fn test_client(config: &RidgeConfig, server: SocketAddr) -> Client {
    let mut config = config.clone();
    config.client.server = server;
    let (shutdown_tx, _) = broadcast::channel(1);
    Client::new(config, shutdown_tx).quiet(true)
}

/// Deterministic non-repeating test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
