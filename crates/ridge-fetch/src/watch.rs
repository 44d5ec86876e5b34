//! Input-file watcher.
//!
//! Every scan re-reads the input file (one file name per line) and
//! downloads, one after another, each name that has not been fetched yet.
//! A failed download stays pending and is retried on the next scan; a name
//! the server does not offer, or refuses as not found, is reported once and
//! skipped.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::HumanBytes;
use tokio::sync::broadcast;

use ridge_services::TransferError;

use crate::coordinator::Client;

const INPUT_HEADER: &str = "# ridge-fetch: one file name per line\n";

/// What one scan did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub downloaded: Vec<String>,
    pub failed: Vec<String>,
    pub unavailable: Vec<String>,
}

pub struct InputWatcher {
    client: Client,
    input_file: PathBuf,
    catalog: Option<BTreeMap<String, u64>>,
    processed: HashSet<String>,
    unavailable: HashSet<String>,
}

impl InputWatcher {
    pub fn new(client: Client, input_file: impl Into<PathBuf>) -> Self {
        Self {
            client,
            input_file: input_file.into(),
            catalog: None,
            processed: HashSet::new(),
            unavailable: HashSet::new(),
        }
    }

    pub fn processed(&self) -> &HashSet<String> {
        &self.processed
    }

    /// Scan until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        ensure_input_file(&self.input_file)?;
        let interval = self.client.config().client.scan_interval();
        tracing::info!(
            input = %self.input_file.display(),
            server = %self.client.server(),
            "watching input file"
        );

        loop {
            let scan = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                scan = self.scan_once() => scan,
            };
            match scan {
                Ok(report) if report != ScanReport::default() => {
                    tracing::info!(
                        downloaded = report.downloaded.len(),
                        failed = report.failed.len(),
                        unavailable = report.unavailable.len(),
                        "scan finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "scan failed"),
            }

            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Read the input file once and fetch everything still pending.
    pub async fn scan_once(&mut self) -> Result<ScanReport> {
        let names = read_input(&self.input_file)?;
        let pending: Vec<String> = names
            .into_iter()
            .filter(|n| !self.processed.contains(n))
            .collect();
        let mut report = ScanReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        // Refresh the catalog when it is missing or a new name is unknown to it.
        let needs_refresh = match &self.catalog {
            None => true,
            Some(catalog) => pending
                .iter()
                .any(|n| !catalog.contains_key(n) && !self.unavailable.contains(n)),
        };
        if needs_refresh {
            self.catalog = Some(self.client.fetch_catalog().await?);
        }
        let catalog = self.catalog.clone().unwrap_or_default();

        for name in pending {
            let Some(&size) = catalog.get(&name) else {
                if self.unavailable.insert(name.clone()) {
                    let reason = TransferError::NotFound(name.clone());
                    tracing::warn!(file = %name, reason = %reason, "not offered by server");
                    println!("{name}: {reason}");
                    report.unavailable.push(name);
                }
                continue;
            };
            self.unavailable.remove(&name);

            match self.client.download_file(&name, size).await {
                Ok(path) => {
                    println!("{name}: downloaded {} to {}", HumanBytes(size), path.display());
                    self.processed.insert(name.clone());
                    report.downloaded.push(name);
                }
                Err(TransferError::Shutdown) => return Ok(report),
                Err(e) if !e.is_retryable() => {
                    // Listed, but the server refuses it; treat like an unlisted name.
                    tracing::warn!(file = %name, error = %e, "download refused, not retrying");
                    println!("{name}: {e}");
                    self.unavailable.insert(name.clone());
                    self.processed.insert(name.clone());
                    report.unavailable.push(name);
                }
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "download failed, will retry");
                    println!("{name}: failed: {e}");
                    report.failed.push(name);
                }
            }
        }
        Ok(report)
    }
}

/// Create the input file with a comment header if it does not exist.
pub fn ensure_input_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, INPUT_HEADER)
        .with_context(|| format!("failed to create input file: {}", path.display()))
}

pub fn read_input(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read input file: {}", path.display()))?;
    Ok(parse_input(&text))
}

/// Names in file order, without blanks, comments or repeats.
pub fn parse_input(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| seen.insert(*l))
        .map(str::to_string)
        .collect()
}
