//! Simulate Command
//!
//! Runs a full upload and range download against an in-process cluster
//! and checks the bytes that come back.

use crate::symbols;
use anyhow::{bail, Context, Result};
use console::style;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use rand::RngCore;
use shardline_client::memory::{MemoryCluster, NodeFault};
use shardline_client::{
    ByteRange, ClientConfig, ObjectLocator, ObjectReceipt, UserCredentials, UserId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const PASSWORD_SALT: &[u8] = b"shardline-simulate";

/// Simulation parameters
pub struct SimulateConfig {
    /// Upload this file instead of random data
    pub file: Option<PathBuf>,
    /// Random object size when no file is given
    pub size: usize,
    pub nodes: usize,
    /// Nodes whose puts fail
    pub failing: usize,
    /// Nodes that never answer
    pub hung: usize,
    /// Users uploading the same object
    pub users: u64,
    /// `start:end` range to read back, either side optional
    pub range: Option<String>,
}

pub async fn run(client_config: ClientConfig, config: SimulateConfig) -> Result<()> {
    if config.failing + config.hung >= config.nodes {
        bail!(
            "{} failing and {} hung nodes leave no healthy node out of {}",
            config.failing,
            config.hung,
            config.nodes
        );
    }
    let range = match &config.range {
        Some(text) => parse_range(text)?,
        None => ByteRange::full(),
    };

    let data = match &config.file {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut data = vec![0u8; config.size];
            rand::thread_rng().fill_bytes(&mut data);
            data
        }
    };

    let cluster = MemoryCluster::new(config.nodes);
    for node in cluster.nodes().iter().take(config.failing) {
        node.set_fault(NodeFault::FailPuts);
    }
    for node in cluster.nodes().iter().skip(config.failing).take(config.hung) {
        node.set_fault(NodeFault::Hang);
    }
    let client = cluster
        .client(client_config)
        .context("Failed to build client")?;
    debug!(
        nodes = config.nodes,
        failing = config.failing,
        hung = config.hung,
        "Simulated cluster ready"
    );

    println!(
        "{} {} nodes ({} failing, {} hung), {} bytes",
        style("Cluster:").cyan(),
        config.nodes,
        config.failing,
        config.hung,
        data.len()
    );
    println!("{}", symbols::HLINE);

    let mut users = Vec::new();
    let mut receipts = Vec::new();
    for id in 1..=config.users.max(1) {
        let password = format!("user-{}", id);
        let user = Arc::new(UserCredentials::from_password(
            UserId(id),
            password.as_bytes(),
            PASSWORD_SALT,
        )?);

        let spinner = spinner(format!("Uploading as user {}", id))?;
        let puts_before = cluster.total_puts();
        let started = Instant::now();
        let result = client.upload_bytes(user.clone(), data.clone()).await;
        spinner.finish_and_clear();

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                println!("{} Upload as user {} failed: {}", style(symbols::CROSS).red(), id, e);
                return Err(e.into());
            }
        };
        info!(
            user = id,
            vhw = %receipt.vhw,
            committed = receipt.committed,
            deduplicated = receipt.deduplicated,
            "Simulated upload finished"
        );
        report_upload(id, &receipt, cluster.total_puts() - puts_before, started);
        users.push(user);
        receipts.push(receipt);
    }

    let owner = &users[0];
    let vhw = receipts[0].vhw;
    let reader = client
        .open(owner, ObjectLocator::hash(vhw), range)
        .await
        .context("Failed to open object")?;

    let pb = ProgressBar::new(reader.remaining());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")?
            .progress_chars("#>-"),
    );

    let gets_before = cluster.total_gets();
    let requests_before = cluster.authority().block_requests().len();
    let mut stream = reader.into_stream().boxed();
    let mut downloaded = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Download failed")?;
        pb.inc(chunk.len() as u64);
        downloaded.extend_from_slice(&chunk);
    }
    pb.finish_and_clear();

    let start = range.start as usize;
    let end = range.end.map(|e| e as usize).unwrap_or(data.len());
    if downloaded != data[start..end] {
        println!("{} Range [{}, {}) does not match", style(symbols::CROSS).red(), start, end);
        bail!("downloaded bytes differ from the original");
    }

    println!(
        "{} Read [{}, {}): {} bytes from {} blocks, {} shard fetches",
        style(symbols::CHECK).green(),
        start,
        end,
        downloaded.len(),
        cluster.authority().block_requests().len() - requests_before,
        cluster.total_gets() - gets_before
    );
    println!(
        "\n{} {} blocks stored for {} users",
        style("Done:").green().bold(),
        cluster.authority().block_count(),
        users.len()
    );
    Ok(())
}

fn spinner(message: String) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

fn report_upload(user: u64, receipt: &ObjectReceipt, puts: usize, started: Instant) {
    println!(
        "{} User {} uploaded {}",
        style(symbols::CHECK).green(),
        user,
        style(&receipt.vhw).bold()
    );
    println!(
        "  blocks: {} committed, {} deduplicated, {} resumed",
        receipt.committed, receipt.deduplicated, receipt.skipped
    );
    println!(
        "  shard puts: {}  elapsed: {} ms",
        puts,
        started.elapsed().as_millis()
    );
}

/// Parse `start:end`, `start:` or `:end`
fn parse_range(text: &str) -> Result<ByteRange> {
    let (start, end) = text
        .split_once(':')
        .with_context(|| format!("Range '{}' must look like start:end", text))?;
    let start = match start.trim() {
        "" => 0,
        s => s.parse().with_context(|| format!("Invalid range start '{}'", s))?,
    };
    match end.trim() {
        "" => Ok(ByteRange::starting_at(start)),
        e => {
            let end = e
                .parse()
                .with_context(|| format!("Invalid range end '{}'", e))?;
            if end < start {
                bail!("Range end {} is before start {}", end, start);
            }
            Ok(ByteRange::new(start, end))
        }
    }
}
