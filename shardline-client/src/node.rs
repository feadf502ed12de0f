//! Storage node interface
//!
//! Nodes hand out capacity tokens, accept signed shard puts and serve
//! shards by hash. A [`NodeConnector`] resolves directory entries to live
//! node handles; a [`NodeDirectory`] publishes the node list the scheduler
//! ranks.

use crate::model::{NodeId, NodeStat};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use shardline_core::{ContentHash, Result, ShardlineError};
use std::sync::Arc;

/// Write admission granted by a node
#[derive(Debug, Clone)]
pub struct CapacityToken {
    /// Node currently accepts writes
    pub writable: bool,
    /// Allocation to attach to the following put
    pub alloc_id: String,
}

/// Signed shard upload
#[derive(Debug, Clone)]
pub struct PutShardRequest {
    pub alloc_id: String,
    pub index: u8,
    pub data: Bytes,
    pub hash: ContentHash,
    /// Requester's Ed25519 verifying key
    pub requester: [u8; 32],
    /// Requester signature over [`put_message`]
    pub signature: Vec<u8>,
}

/// Node verdict on a put
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutStatus {
    Stored,
    /// Same shard already present; counts as success
    AlreadyExists,
    /// Node is full; blacklist it
    NoSpace,
    Failed(String),
}

/// Node reply to a put
#[derive(Debug, Clone)]
pub struct PutShardResponse {
    pub status: PutStatus,
    /// Node signature over [`put_message`], forwarded to the authority
    pub signature: Vec<u8>,
}

/// Storage node RPCs
#[async_trait]
pub trait StorageNode: Send + Sync {
    /// Request write admission. `start` is when the shard attempt began and
    /// `retry` counts earlier denials in this round.
    async fn get_capacity_token(&self, start: DateTime<Utc>, retry: u32) -> Result<CapacityToken>;

    async fn put_shard(&self, request: PutShardRequest) -> Result<PutShardResponse>;

    /// Fetch a shard payload; `None` if the node does not hold it
    async fn get_shard(&self, hash: ContentHash) -> Result<Option<Bytes>>;
}

/// Resolves a directory entry to a node handle
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, node: &NodeStat) -> Result<Arc<dyn StorageNode>>;
}

/// Source of node snapshots for ranking
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<NodeStat>>;
}

/// Bytes both sides sign for a shard put
pub fn put_message(alloc_id: &str, hash: &ContentHash) -> Vec<u8> {
    let mut message = Vec::with_capacity(8 + alloc_id.len() + 32);
    message.extend_from_slice(b"shard-put:");
    message.extend_from_slice(alloc_id.as_bytes());
    message.extend_from_slice(hash.as_bytes());
    message
}

/// Sign a shard put
pub fn sign_put(key: &SigningKey, alloc_id: &str, hash: &ContentHash) -> Vec<u8> {
    key.sign(&put_message(alloc_id, hash)).to_bytes().to_vec()
}

/// Check a put signature against a raw Ed25519 public key
pub fn verify_put(
    public_key: &[u8; 32],
    alloc_id: &str,
    hash: &ContentHash,
    signature: &[u8],
    signer: &NodeId,
) -> Result<()> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|e| {
        ShardlineError::VerificationFailed(format!("bad public key for {}: {}", signer, e))
    })?;
    let signature = Signature::from_slice(signature).map_err(|e| {
        ShardlineError::VerificationFailed(format!("malformed signature from {}: {}", signer, e))
    })?;
    key.verify(&put_message(alloc_id, hash), &signature)
        .map_err(|_| {
            ShardlineError::VerificationFailed(format!(
                "signature from {} does not cover shard {}",
                signer, hash
            ))
        })
}
