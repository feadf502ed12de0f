//! Shard transport
//!
//! Moves one shard to or from storage nodes. Uploads run admission and
//! transfer against one node at a time and move on to the next eligible
//! node on failure. Downloads hit a single node and verify the payload.

use crate::blacklist::BlacklistReason;
use crate::config::TransportConfig;
use crate::model::{NodeId, NodeStat, ShardLocation, ShardPlacement};
use crate::node::{sign_put, CapacityToken, NodeConnector, PutShardRequest, PutStatus, StorageNode};
use crate::scheduler::{BlockAllocator, NodeScheduler};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use shardline_core::{Result, Shard, ShardlineError};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct ShardTransport {
    connector: Arc<dyn NodeConnector>,
    scheduler: Arc<NodeScheduler>,
    signer: Arc<SigningKey>,
    config: TransportConfig,
}

impl ShardTransport {
    pub fn new(
        connector: Arc<dyn NodeConnector>,
        scheduler: Arc<NodeScheduler>,
        signer: Arc<SigningKey>,
        config: TransportConfig,
    ) -> Self {
        Self {
            connector,
            scheduler,
            signer,
            config,
        }
    }

    pub fn scheduler(&self) -> &Arc<NodeScheduler> {
        &self.scheduler
    }

    /// Place one shard on some node chosen by `allocator`.
    ///
    /// Each failed node is skipped for the rest of this shard and charged
    /// an error; a saturated node is also dropped from the whole block.
    /// `cancel` stops further attempts but never interrupts a transfer.
    pub async fn upload(
        &self,
        shard: &Shard,
        allocator: &BlockAllocator,
        cancel: &CancellationToken,
    ) -> Result<ShardPlacement> {
        let mut tried: HashSet<NodeId> = HashSet::new();
        let mut last_error = None;

        for attempt in 0..self.config.max_node_attempts {
            if cancel.is_cancelled() {
                return Err(ShardlineError::Cancelled);
            }

            let node = tokio::select! {
                node = allocator.next_node(&tried) => node?,
                _ = cancel.cancelled() => return Err(ShardlineError::Cancelled),
            };

            let started = Instant::now();
            match self.upload_to(&node, shard).await {
                Ok(placement) => {
                    let elapsed = started.elapsed();
                    self.scheduler.record_success(&node.id, elapsed);
                    debug!(
                        shard_index = shard.index,
                        vhf = %shard.hash,
                        node = %node.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Shard placed"
                    );
                    return Ok(placement);
                }
                Err(e) => {
                    warn!(
                        shard_index = shard.index,
                        vhf = %shard.hash,
                        node = %node.id,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "Shard upload failed, trying next node"
                    );
                    tried.insert(node.id.clone());
                    allocator.release(&node.id);
                    if self.scheduler.record_failure(&node.id) {
                        allocator.exclude(&node.id);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(ShardlineError::NoEligibleNode { waited_ms: 0 }))
    }

    async fn upload_to(&self, node: &NodeStat, shard: &Shard) -> Result<ShardPlacement> {
        let client = self.connector.connect(node).await?;
        let token = self.admit(client.as_ref(), node).await?;

        let request = PutShardRequest {
            alloc_id: token.alloc_id.clone(),
            index: shard.index,
            data: shard.data.clone(),
            hash: shard.hash,
            requester: self.signer.verifying_key().to_bytes(),
            signature: sign_put(&self.signer, &token.alloc_id, &shard.hash),
        };
        let response = self.timed(&node.id, client.put_shard(request)).await?;

        match response.status {
            PutStatus::Stored | PutStatus::AlreadyExists => Ok(ShardPlacement {
                index: shard.index,
                hash: shard.hash,
                node: node.id.clone(),
                alloc_id: token.alloc_id,
                node_signature: response.signature,
            }),
            PutStatus::NoSpace => {
                self.scheduler
                    .blacklist()
                    .insert(&node.id, BlacklistReason::NoSpace);
                Err(ShardlineError::communication(node.id.as_str(), "no space left"))
            }
            PutStatus::Failed(message) => {
                Err(ShardlineError::communication(node.id.as_str(), message))
            }
        }
    }

    /// Capacity-token round against one node
    async fn admit(&self, client: &dyn StorageNode, node: &NodeStat) -> Result<CapacityToken> {
        let start = Utc::now();
        for retry in 0..self.config.admission_retries {
            if retry > 0 {
                tokio::time::sleep(self.config.admission_retry_delay()).await;
            }
            match self
                .timed(&node.id, client.get_capacity_token(start, retry))
                .await
            {
                Ok(token) if token.writable => return Ok(token),
                Ok(_) => debug!(node = %node.id, retry, "Capacity token denied"),
                Err(e) => debug!(node = %node.id, retry, error = %e, "Capacity token request failed"),
            }
        }
        Err(ShardlineError::AdmissionDenied {
            node: node.id.to_string(),
        })
    }

    /// Fetch and verify one shard.
    ///
    /// The payload is truncated to `shard_size` before hashing; a mismatch
    /// is charged to the node as an integrity fault.
    pub async fn download(&self, location: &ShardLocation, shard_size: usize) -> Result<Shard> {
        let node = &location.node;
        let started = Instant::now();

        let fetched = async {
            let client = self.connector.connect(node).await?;
            let payload = self
                .timed(&node.id, client.get_shard(location.hash))
                .await?
                .ok_or_else(|| {
                    ShardlineError::NotFound(format!("shard {} on {}", location.hash, node.id))
                })?;
            Shard::verify_payload(location.index, payload, &location.hash, shard_size)
        }
        .await;

        let elapsed = started.elapsed();
        match fetched {
            Ok(shard) => {
                self.scheduler.record_success(&node.id, elapsed);
                Ok(shard)
            }
            Err(e) => {
                warn!(
                    shard_index = location.index,
                    vhf = %location.hash,
                    node = %node.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Shard download failed"
                );
                self.scheduler.record_failure(&node.id);
                Err(e)
            }
        }
    }

    async fn timed<T>(&self, node: &NodeId, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit: Duration = self.config.shard_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                debug!(node = %node, timeout_ms = limit.as_millis() as u64, "Node call timed out");
                Err(ShardlineError::Timeout(limit.as_millis() as u64))
            }
        }
    }
}
