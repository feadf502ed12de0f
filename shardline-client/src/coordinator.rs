//! Fan-out/fan-in shard placement for one block
//!
//! Every shard gets a primary upload task. After a delay, a backup wave
//! re-uploads a bounded number of still-unplaced shards on other nodes.
//! The first success per shard index wins. Once enough distinct indices
//! are placed the backup wave is cancelled, but primaries still in flight
//! are awaited until they finish or the block deadline passes, so every
//! replica that lands is recorded. Duplicate results for an index are
//! discarded.

use crate::config::CoordinatorConfig;
use crate::model::{NodeId, ShardPlacement};
use crate::pool::ResourcePools;
use crate::scheduler::{BlockAllocator, NodeScheduler};
use crate::transport::ShardTransport;
use shardline_core::{RedundancyMode, Result, Shard, ShardlineError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wave {
    Primary,
    Backup,
}

struct Outcome {
    index: u8,
    wave: Wave,
    result: Result<ShardPlacement>,
}

pub struct ShardCoordinator {
    transport: Arc<ShardTransport>,
    pools: ResourcePools,
    config: CoordinatorConfig,
}

impl ShardCoordinator {
    pub fn new(
        transport: Arc<ShardTransport>,
        pools: ResourcePools,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            transport,
            pools,
            config,
        }
    }

    pub fn scheduler(&self) -> &Arc<NodeScheduler> {
        self.transport.scheduler()
    }

    /// Successes needed before a block of this mode may commit
    pub fn required_successes(&self, mode: RedundancyMode) -> usize {
        match mode {
            RedundancyMode::Stored => 0,
            RedundancyMode::Copy { copies } => {
                self.config.copy_min_success.clamp(1, copies as usize)
            }
            RedundancyMode::Erasure { data, parity } => {
                let total = data as usize + parity as usize;
                match self.config.erasure_min_success {
                    0 => total,
                    n => n.clamp(data as usize, total),
                }
            }
        }
    }

    /// Place `shards`, succeeding once `required` distinct indices land.
    ///
    /// Returns every placement recorded before the tasks drained or the
    /// block deadline passed, sorted by index. Fails with
    /// `InsufficientRedundancy` if fewer than `required` landed.
    pub async fn place(&self, shards: Vec<Shard>, required: usize) -> Result<Vec<ShardPlacement>> {
        self.place_avoiding(shards, required, &[]).await
    }

    /// [`place`](Self::place), never using any node in `avoid`
    pub async fn place_avoiding(
        &self,
        shards: Vec<Shard>,
        required: usize,
        avoid: &[NodeId],
    ) -> Result<Vec<ShardPlacement>> {
        if required == 0 || required > shards.len() {
            return Err(ShardlineError::Argument(format!(
                "cannot require {} of {} shards",
                required,
                shards.len()
            )));
        }

        let scheduler = self.transport.scheduler().clone();
        scheduler.begin_block().await?;
        let allocator = Arc::new(BlockAllocator::new(scheduler));
        for node in avoid {
            allocator.exclude(node);
        }

        // `backups` stops the backup wave once the threshold is met; `done`
        // stops everything once the block is decided.
        let done = CancellationToken::new();
        let backups = done.child_token();
        let _stop = done.clone().drop_guard();

        let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();
        let mut outstanding = 0usize;

        for shard in &shards {
            self.spawn_upload(shard.clone(), Wave::Primary, &allocator, &done, &tx);
            outstanding += 1;
        }

        let started = Instant::now();
        let deadline = started + self.config.block_timeout();
        let backup_at = started + self.config.backup_delay();
        let backup_budget = self.config.backup_count(shards.len());
        let mut backups_launched = backup_budget == 0;

        let mut placed: BTreeMap<u8, ShardPlacement> = BTreeMap::new();
        let mut failures = 0usize;

        let expired = loop {
            let settled = placed.len() >= required;
            if settled && !backups.is_cancelled() {
                backups.cancel();
                backups_launched = true;
                debug!(placed = placed.len(), required, outstanding, "Threshold met, draining primaries");
            }

            if placed.len() == shards.len() {
                break false;
            }

            if outstanding == 0 {
                if backups_launched {
                    break false;
                }
                // Primaries all finished short; no point waiting for the timer
                outstanding += self.launch_backups(
                    &shards,
                    &placed,
                    backup_budget,
                    &allocator,
                    &backups,
                    &tx,
                );
                backups_launched = true;
                continue;
            }

            tokio::select! {
                Some(outcome) = rx.recv() => {
                    outstanding -= 1;
                    match outcome.result {
                        Ok(placement) => {
                            if placed.contains_key(&outcome.index) {
                                debug!(
                                    shard_index = outcome.index,
                                    wave = ?outcome.wave,
                                    "Duplicate shard placement discarded"
                                );
                            } else {
                                placed.insert(outcome.index, placement);
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            debug!(
                                shard_index = outcome.index,
                                wave = ?outcome.wave,
                                error = %e,
                                "Shard task gave up"
                            );
                        }
                    }
                }
                _ = tokio::time::sleep_until(backup_at), if !backups_launched => {
                    outstanding += self.launch_backups(
                        &shards,
                        &placed,
                        backup_budget,
                        &allocator,
                        &backups,
                        &tx,
                    );
                    backups_launched = true;
                }
                _ = tokio::time::sleep_until(deadline) => break true,
            }
        };

        backups.cancel();
        done.cancel();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if placed.len() >= required {
            info!(
                placed = placed.len(),
                required,
                failures,
                expired,
                elapsed_ms,
                "Block shards placed"
            );
            Ok(placed.into_values().collect())
        } else {
            warn!(
                placed = placed.len(),
                required,
                failures,
                expired,
                elapsed_ms,
                "Block placement fell short"
            );
            Err(ShardlineError::InsufficientRedundancy {
                placed: placed.len(),
                required,
            })
        }
    }

    fn launch_backups(
        &self,
        shards: &[Shard],
        placed: &BTreeMap<u8, ShardPlacement>,
        budget: usize,
        allocator: &Arc<BlockAllocator>,
        cancel: &CancellationToken,
        tx: &mpsc::UnboundedSender<Outcome>,
    ) -> usize {
        let pending: Vec<&Shard> = shards
            .iter()
            .filter(|s| !placed.contains_key(&s.index))
            .take(budget)
            .collect();

        if !pending.is_empty() {
            info!(backups = pending.len(), "Launching backup shard uploads");
        }
        for shard in &pending {
            self.spawn_upload((*shard).clone(), Wave::Backup, allocator, cancel, tx);
        }
        pending.len()
    }

    fn spawn_upload(
        &self,
        shard: Shard,
        wave: Wave,
        allocator: &Arc<BlockAllocator>,
        cancel: &CancellationToken,
        tx: &mpsc::UnboundedSender<Outcome>,
    ) {
        let transport = self.transport.clone();
        let pools = self.pools.clone();
        let allocator = allocator.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let result = async {
                let _permit = tokio::select! {
                    permit = pools.acquire_shard_upload() => permit?,
                    _ = cancel.cancelled() => return Err(ShardlineError::Cancelled),
                };
                transport.upload(&shard, &allocator, &cancel).await
            }
            .await;

            // Receiver is gone once the block is decided
            let _ = tx.send(Outcome {
                index: shard.index,
                wave,
                result,
            });
        });
    }
}
