//! Long-running mode: follow the input file.

use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::broadcast;

use ridge_fetch::{Client, InputWatcher};

pub async fn cmd_watch(client: Client, input: PathBuf, shutdown: broadcast::Receiver<()>) -> Result<()> {
    InputWatcher::new(client, input).run(shutdown).await
}
