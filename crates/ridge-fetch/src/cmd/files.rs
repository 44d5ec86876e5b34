//! One-shot commands: list the catalog, download named files.

use anyhow::{bail, Result};

use indicatif::HumanBytes;
use ridge_fetch::Client;
use ridge_services::TransferError;

pub async fn cmd_list(client: &Client) -> Result<()> {
    let catalog = client.fetch_catalog().await?;
    if catalog.is_empty() {
        println!("No files offered by {}", client.server());
        return Ok(());
    }

    let width = catalog.keys().map(String::len).max().unwrap_or(0);
    for (name, size) in &catalog {
        println!("{name:<width$}  {:>10}", HumanBytes(*size).to_string());
    }
    Ok(())
}

pub async fn cmd_get(client: &Client, names: &[String]) -> Result<()> {
    let catalog = client.fetch_catalog().await?;
    let mut failed = 0;

    for name in names {
        let Some(&size) = catalog.get(name) else {
            eprintln!("{name}: {}", TransferError::NotFound(name.clone()));
            failed += 1;
            continue;
        };
        match client.download_file(name, size).await {
            Ok(path) => println!("{name}: downloaded {} to {}", HumanBytes(size), path.display()),
            Err(TransferError::Shutdown) => bail!("interrupted"),
            Err(e) => {
                eprintln!("{name}: failed: {e}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} downloads failed", names.len());
    }
    Ok(())
}
