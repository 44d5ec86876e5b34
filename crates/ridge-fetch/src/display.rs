//! Terminal progress rendering.
//!
//! One indicatif `MultiProgress` per file: an overall bar followed by a bar
//! per part, redrawn in place from `FileProgress` snapshots.

use std::collections::BTreeMap;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::broadcast;

use ridge_services::{ProgressSnapshot, SharedProgress};

const RENDER_INTERVAL: Duration = Duration::from_millis(500);

const OVERALL_TEMPLATE: &str =
    "{msg:24!} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const PART_TEMPLATE: &str = "  {prefix:>7} [{bar:40.green/white}] {bytes}/{total_bytes} {msg}";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Bars for one file download.
#[derive(Clone)]
pub struct ProgressView {
    file_name: String,
    overall: ProgressBar,
    parts: BTreeMap<usize, ProgressBar>,
}

impl ProgressView {
    /// Bars drawn to stderr.
    pub fn new(snapshot: &ProgressSnapshot) -> Self {
        Self::with_target(snapshot, ProgressDrawTarget::stderr())
    }

    /// Bars that track state but never draw.
    pub fn hidden(snapshot: &ProgressSnapshot) -> Self {
        Self::with_target(snapshot, ProgressDrawTarget::hidden())
    }

    fn with_target(snapshot: &ProgressSnapshot, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let overall = multi.add(ProgressBar::new(snapshot.total_bytes));
        overall.set_style(style(OVERALL_TEMPLATE));
        overall.set_message(snapshot.file_name.clone());

        let parts = snapshot
            .parts
            .iter()
            .map(|(index, part)| {
                let bar = multi.add(ProgressBar::new(part.total_bytes));
                bar.set_style(style(PART_TEMPLATE));
                bar.set_prefix(format!("part {index}"));
                (*index, bar)
            })
            .collect();

        Self {
            file_name: snapshot.file_name.clone(),
            overall,
            parts,
        }
    }

    pub fn update(&self, snapshot: &ProgressSnapshot) {
        self.overall.set_position(snapshot.received_bytes());
        for (index, part) in &snapshot.parts {
            let Some(bar) = self.parts.get(index) else {
                continue;
            };
            bar.set_position(part.received_bytes);
            if bar.is_finished() {
                continue;
            }
            if part.failed {
                bar.abandon_with_message("failed");
            } else if part.complete {
                bar.finish_with_message("done");
            }
        }
    }

    /// Final redraw; leaves the bars on screen.
    pub fn finish(&self, snapshot: &ProgressSnapshot) {
        self.update(snapshot);
        if snapshot.parts.iter().any(|(_, part)| part.failed) {
            self.overall.abandon_with_message(format!("{} failed", self.file_name));
        } else {
            self.overall.finish_with_message(format!("{} done", self.file_name));
        }
    }

    pub fn overall(&self) -> &ProgressBar {
        &self.overall
    }

    pub fn part(&self, index: usize) -> Option<&ProgressBar> {
        self.parts.get(&index)
    }
}

/// Refresh `view` on an interval until the file is finished or shutdown.
pub async fn render_loop(
    progress: SharedProgress,
    view: ProgressView,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(RENDER_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                let snapshot = progress.snapshot().await;
                view.update(&snapshot);
                if snapshot.is_finished() {
                    return;
                }
            }
        }
    }
}
