//! Shared data model for authority and storage node exchanges

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_core::{ContentHash, RedundancyMode, WrappedKey};
use std::fmt;
use uuid::Uuid;

/// Storage node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// User identifier as known by the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user-{}", self.0)
    }
}

/// Upload session handle issued by the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authority-assigned block identifier (`VBI`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time view of a storage node published by the node directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStat {
    pub id: NodeId,
    /// Network address used by the connector
    pub address: String,
    /// Ed25519 key the node signs put acknowledgements with
    pub public_key: [u8; 32],
    pub ok_times: u64,
    pub error_times: u64,
    /// Sum of observed request latencies
    pub total_latency_ms: u64,
    pub updated_at: DateTime<Utc>,
}

impl NodeStat {
    pub fn new(id: impl Into<String>, address: impl Into<String>, public_key: [u8; 32]) -> Self {
        Self {
            id: NodeId::new(id),
            address: address.into(),
            public_key,
            ok_times: 0,
            error_times: 0,
            total_latency_ms: 0,
            updated_at: Utc::now(),
        }
    }

    /// Mean latency over successful requests; unknown nodes rank first
    pub fn avg_latency_ms(&self) -> u64 {
        if self.ok_times == 0 {
            0
        } else {
            self.total_latency_ms / self.ok_times
        }
    }
}

/// One shard stored on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlacement {
    pub index: u8,
    /// Shard hash (`VHF`)
    pub hash: ContentHash,
    pub node: NodeId,
    /// Allocation granted by the node's capacity token
    pub alloc_id: String,
    /// Node signature over the put, checked by the authority at commit
    pub node_signature: Vec<u8>,
}

/// Where a shard can be fetched from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardLocation {
    pub index: u8,
    pub hash: ContentHash,
    pub node: NodeStat,
}

/// A candidate for block-level deduplication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupCandidate {
    /// `KS` wrapped under the content key (`KED`)
    pub ked: WrappedKey,
    /// Redundancy hash of the stored block (`VHB`)
    pub vhb: ContentHash,
    pub mode: RedundancyMode,
}

/// What a block commit publishes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommitPayload {
    /// Block already stored; link to it
    Duplicate { vhb: ContentHash },
    /// Block placed by this client
    Fresh(FreshBlock),
}

/// Metadata of a newly stored block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshBlock {
    pub vhb: ContentHash,
    pub ked: WrappedKey,
    pub mode: RedundancyMode,
    /// Hash of every shard by index, placed or not
    pub shard_hashes: Vec<ContentHash>,
    pub shard_size: usize,
    /// Successful placements (may be a subset of `shard_hashes`)
    pub placements: Vec<ShardPlacement>,
    /// Ciphertext kept by the authority in stored mode
    pub stored: Option<Bytes>,
}

/// Block commit request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCommit {
    pub session: SessionId,
    pub ordinal: u32,
    /// Plaintext hash (`VHP`)
    pub vhp: ContentHash,
    /// `KS` wrapped under the user key (`KEU`)
    pub keu: WrappedKey,
    pub key_version: u32,
    /// Plaintext length
    pub original_size: u64,
    /// Ciphertext length
    pub real_size: u64,
    pub payload: CommitPayload,
}

/// Authority acknowledgement of a block commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub vbi: BlockId,
    /// Authority shard that owns the block metadata
    pub super_id: u32,
    /// The commit linked an existing block
    pub deduplicated: bool,
}

/// Per-user link from an object position to a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub vbi: BlockId,
    pub super_id: u32,
    pub original_size: u64,
    pub real_size: u64,
    pub keu: WrappedKey,
    pub key_version: u32,
    pub ordinal: u32,
}

/// Result of opening an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInit {
    pub session: SessionId,
    /// Ordinals already committed by an earlier attempt
    pub committed: Vec<u32>,
    /// An open session was picked up rather than a new one created
    pub resumed: bool,
}

/// How a download names its object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ObjectLocator {
    /// Whole-object hash (`VHW`)
    Hash { vhw: ContentHash },
    /// Bucket key, optionally pinned to a version
    Key {
        bucket: String,
        key: String,
        version: Option<String>,
    },
}

impl ObjectLocator {
    pub fn hash(vhw: ContentHash) -> Self {
        Self::Hash { vhw }
    }

    pub fn key(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Key {
            bucket: bucket.into(),
            key: key.into(),
            version: None,
        }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash { vhw } => write!(f, "vhw:{}", vhw),
            Self::Key {
                bucket,
                key,
                version: Some(v),
            } => write!(f, "{}/{}@{}", bucket, key, v),
            Self::Key { bucket, key, .. } => write!(f, "{}/{}", bucket, key),
        }
    }
}

/// Object metadata returned for a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectManifest {
    pub vhw: ContentHash,
    pub length: u64,
    pub references: Vec<Reference>,
}

/// Where a block's ciphertext lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockLocation {
    /// Ciphertext held by the authority
    Stored { data: Bytes },
    /// Shards spread over storage nodes
    Sharded {
        mode: RedundancyMode,
        shard_size: usize,
        shards: Vec<ShardLocation>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_latency() {
        let mut stat = NodeStat::new("n1", "127.0.0.1:9000", [0u8; 32]);
        assert_eq!(stat.avg_latency_ms(), 0);
        stat.ok_times = 4;
        stat.total_latency_ms = 100;
        assert_eq!(stat.avg_latency_ms(), 25);
    }

    #[test]
    fn test_locator_display() {
        let vhw = ContentHash::compute(b"object");
        assert!(ObjectLocator::hash(vhw).to_string().starts_with("vhw:"));
        assert_eq!(ObjectLocator::key("photos", "a.jpg").to_string(), "photos/a.jpg");
    }

    #[test]
    fn test_commit_payload_serde_tag() {
        let payload = CommitPayload::Duplicate {
            vhb: ContentHash::compute(b"vhb"),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"kind\":\"duplicate\""));
    }
}
