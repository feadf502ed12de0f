//! Hash Command
//!
//! Prints the object hash and block layout of a local file.

use anyhow::{Context, Result};
use console::style;
use shardline_core::{block_count, ContentHash};
use std::path::Path;
use tracing::debug;

pub async fn run(path: &Path, block_size: usize) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut file = file.into_std().await;

    let started = std::time::Instant::now();
    let (vhw, length) = tokio::task::spawn_blocking(move || ContentHash::compute_reader(&mut file))
        .await
        .context("Hashing task failed")??;
    debug!(
        path = %path.display(),
        length,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "File hashed"
    );

    println!("{}", style(path.display()).bold());
    println!("  hash    {}", vhw);
    println!("  length  {} bytes", length);
    println!(
        "  blocks  {} x {} bytes",
        block_count(length, block_size),
        block_size
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_hash_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[3u8; 5000]).unwrap();
        run(file.path(), 1024).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("absent"), 1024).await.is_err());
    }
}
