//! Per-file download progress, shared between part tasks and the renderer.
//!
//! Each part reports its own byte count; the file total is derived on read.
//! Counts only grow, so a snapshot taken at any time is consistent enough
//! to render.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartProgress {
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub complete: bool,
    pub failed: bool,
}

impl PartProgress {
    pub fn percent(&self) -> f64 {
        percent(self.received_bytes, self.total_bytes)
    }
}

/// Point-in-time copy of a file's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub file_name: String,
    pub total_bytes: u64,
    pub parts: Vec<(usize, PartProgress)>,
}

impl ProgressSnapshot {
    pub fn received_bytes(&self) -> u64 {
        self.parts.iter().map(|(_, p)| p.received_bytes).sum()
    }

    pub fn percent(&self) -> f64 {
        percent(self.received_bytes(), self.total_bytes)
    }

    pub fn is_finished(&self) -> bool {
        self.parts.iter().all(|(_, p)| p.complete || p.failed)
    }
}

#[derive(Debug)]
pub struct FileProgress {
    file_name: String,
    total_bytes: u64,
    parts: Mutex<BTreeMap<usize, PartProgress>>,
}

pub type SharedProgress = Arc<FileProgress>;

impl FileProgress {
    pub fn new(file_name: impl Into<String>, total_bytes: u64) -> SharedProgress {
        Arc::new(Self {
            file_name: file_name.into(),
            total_bytes,
            parts: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub async fn register(&self, part: usize, total_bytes: u64) {
        self.parts.lock().await.insert(
            part,
            PartProgress {
                total_bytes,
                ..PartProgress::default()
            },
        );
    }

    /// Count newly stored bytes. Capped at the part's length.
    pub async fn add_received(&self, part: usize, bytes: u64) {
        let mut parts = self.parts.lock().await;
        if let Some(p) = parts.get_mut(&part) {
            p.received_bytes = p.received_bytes.saturating_add(bytes).min(p.total_bytes);
        }
    }

    pub async fn mark_complete(&self, part: usize) {
        let mut parts = self.parts.lock().await;
        if let Some(p) = parts.get_mut(&part) {
            p.received_bytes = p.total_bytes;
            p.complete = true;
        }
    }

    pub async fn mark_failed(&self, part: usize) {
        if let Some(p) = self.parts.lock().await.get_mut(&part) {
            p.failed = true;
        }
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        let parts = self.parts.lock().await;
        ProgressSnapshot {
            file_name: self.file_name.clone(),
            total_bytes: self.total_bytes,
            parts: parts.iter().map(|(i, p)| (*i, *p)).collect(),
        }
    }
}

fn percent(received: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    received as f64 * 100.0 / total as f64
}
