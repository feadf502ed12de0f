//! Block orchestrator
//!
//! Drives one plaintext block to a committed reference:
//!
//! 1. Ask the authority for blocks with the same plaintext hash and prove
//!    ownership of a candidate by re-deriving its redundancy hash.
//! 2. Otherwise encrypt under a fresh key, pick a redundancy mode, encode,
//!    and place the shards.
//! 3. Commit. If the authority rejects placements on blacklisted nodes,
//!    only those shards are placed again before the next commit.

use crate::authority::MetadataAuthority;
use crate::blacklist::BlacklistReason;
use crate::coordinator::ShardCoordinator;
use crate::model::{
    BlockCommit, CommitPayload, CommitReceipt, DedupCandidate, FreshBlock, NodeId, SessionId,
    ShardPlacement,
};
use crate::UserCredentials;
use bytes::Bytes;
use shardline_core::{
    encode, encrypt_block, shard_set_hash, unwrap_key, wrap_key, BlockKey, ContentHash,
    PlainBlock, RedundancyMode, RedundancyPolicy, Result, Shard, ShardlineError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Progress of a block through the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPhase {
    Init,
    DedupCheck,
    Encrypt,
    Encode,
    Place,
    Commit,
    Done,
}

/// Result of uploading one block
#[derive(Debug, Clone)]
pub struct BlockReceipt {
    pub ordinal: u32,
    pub vhp: ContentHash,
    pub commit: CommitReceipt,
    /// Commit rounds spent (more than one after blacklist re-placement)
    pub commit_attempts: u32,
}

pub struct BlockUploader {
    authority: Arc<dyn MetadataAuthority>,
    coordinator: Arc<ShardCoordinator>,
    policy: Arc<dyn RedundancyPolicy>,
    max_commit_attempts: u32,
}

impl BlockUploader {
    pub fn new(
        authority: Arc<dyn MetadataAuthority>,
        coordinator: Arc<ShardCoordinator>,
        policy: Arc<dyn RedundancyPolicy>,
        max_commit_attempts: u32,
    ) -> Self {
        Self {
            authority,
            coordinator,
            policy,
            max_commit_attempts: max_commit_attempts.max(1),
        }
    }

    #[instrument(
        skip_all,
        fields(session = %session, ordinal = block.ordinal, vhp = %block.vhp)
    )]
    pub async fn upload(
        &self,
        session: SessionId,
        user: &UserCredentials,
        block: PlainBlock,
    ) -> Result<BlockReceipt> {
        let started = Instant::now();
        let mut phase = BlockPhase::Init;

        let result = self.run(session, user, &block, &mut phase).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(receipt) => info!(
                vbi = %receipt.commit.vbi,
                deduplicated = receipt.commit.deduplicated,
                elapsed_ms,
                "Block committed"
            ),
            Err(e) => warn!(?phase, elapsed_ms, error = %e, "Block upload failed"),
        }
        result
    }

    async fn run(
        &self,
        session: SessionId,
        user: &UserCredentials,
        block: &PlainBlock,
        phase: &mut BlockPhase,
    ) -> Result<BlockReceipt> {
        *phase = BlockPhase::DedupCheck;
        let candidates = self.authority.check_block_dup(session, block.vhp).await?;
        for candidate in &candidates {
            if let Some((ks, real_size)) = verify_candidate(block, candidate)? {
                debug!(vhb = %candidate.vhb, "Dedup candidate verified");
                *phase = BlockPhase::Commit;
                let commit = BlockCommit {
                    session,
                    ordinal: block.ordinal,
                    vhp: block.vhp,
                    keu: wrap_key(&ks, &user.key),
                    key_version: user.key_version,
                    original_size: block.original_size(),
                    real_size,
                    payload: CommitPayload::Duplicate { vhb: candidate.vhb },
                };
                let receipt = self.authority.commit_block(commit).await?;
                *phase = BlockPhase::Done;
                return Ok(BlockReceipt {
                    ordinal: block.ordinal,
                    vhp: block.vhp,
                    commit: receipt,
                    commit_attempts: 1,
                });
            }
            debug!(vhb = %candidate.vhb, "Dedup candidate did not verify");
        }

        *phase = BlockPhase::Encrypt;
        let ks = BlockKey::generate();
        let ciphertext = Bytes::from(encrypt_block(&block.data, &ks)?.to_bytes());

        *phase = BlockPhase::Encode;
        let mode = self.policy.choose(ciphertext.len());
        let shards = encode(&ciphertext, mode)?;
        let vhb = shard_set_hash(mode, &shards);
        debug!(%mode, real_size = ciphertext.len(), vhb = %vhb, "Block encoded");

        let fresh = FreshBlock {
            vhb,
            ked: wrap_key(&ks, &block.kd),
            mode,
            shard_hashes: shards.iter().map(|s| s.hash).collect(),
            shard_size: shards.first().map(|s| s.size()).unwrap_or(0),
            placements: Vec::new(),
            stored: None,
        };
        let mut commit = BlockCommit {
            session,
            ordinal: block.ordinal,
            vhp: block.vhp,
            keu: wrap_key(&ks, &user.key),
            key_version: user.key_version,
            original_size: block.original_size(),
            real_size: ciphertext.len() as u64,
            payload: CommitPayload::Fresh(fresh),
        };

        if !mode.is_distributed() {
            if let CommitPayload::Fresh(fresh) = &mut commit.payload {
                fresh.stored = Some(ciphertext);
            }
            *phase = BlockPhase::Commit;
            let receipt = self.authority.commit_block(commit).await?;
            *phase = BlockPhase::Done;
            return Ok(BlockReceipt {
                ordinal: block.ordinal,
                vhp: block.vhp,
                commit: receipt,
                commit_attempts: 1,
            });
        }

        *phase = BlockPhase::Place;
        let required = self.coordinator.required_successes(mode);
        let placements = self.coordinator.place(shards.clone(), required).await?;

        *phase = BlockPhase::Commit;
        self.commit_with_replacement(commit, &shards, placements, phase)
            .await
            .map(|(receipt, attempts)| {
                *phase = BlockPhase::Done;
                BlockReceipt {
                    ordinal: block.ordinal,
                    vhp: block.vhp,
                    commit: receipt,
                    commit_attempts: attempts,
                }
            })
    }

    async fn commit_with_replacement(
        &self,
        mut commit: BlockCommit,
        shards: &[Shard],
        mut placements: Vec<ShardPlacement>,
        phase: &mut BlockPhase,
    ) -> Result<(CommitReceipt, u32)> {
        let mut attempt = 1;
        loop {
            if let CommitPayload::Fresh(fresh) = &mut commit.payload {
                fresh.placements = placements.clone();
            }

            match self.authority.commit_block(commit.clone()).await {
                Ok(receipt) => return Ok((receipt, attempt)),
                Err(ShardlineError::NodesBlacklisted { nodes }) if attempt < self.max_commit_attempts => {
                    attempt += 1;
                    warn!(?nodes, attempt, "Authority rejected blacklisted nodes, re-placing");

                    let rejected: HashSet<NodeId> = nodes.into_iter().map(NodeId).collect();
                    let scheduler = self.coordinator.scheduler();
                    for node in &rejected {
                        scheduler.blacklist().insert(node, BlacklistReason::Authority);
                    }

                    let (kept, dropped): (Vec<_>, Vec<_>) = placements
                        .into_iter()
                        .partition(|p| !rejected.contains(&p.node));
                    let indices: HashSet<u8> = dropped.iter().map(|p| p.index).collect();
                    let replace: Vec<Shard> = shards
                        .iter()
                        .filter(|s| indices.contains(&s.index))
                        .cloned()
                        .collect();

                    placements = kept;
                    if !replace.is_empty() {
                        *phase = BlockPhase::Place;
                        let required = replace.len();
                        let holders: Vec<NodeId> = placements.iter().map(|p| p.node.clone()).collect();
                        let mut replaced = self
                            .coordinator
                            .place_avoiding(replace, required, &holders)
                            .await?;
                        *phase = BlockPhase::Commit;
                        placements.append(&mut replaced);
                    }
                    placements.sort_by_key(|p| p.index);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Prove knowledge of a candidate block.
///
/// Unwraps the candidate's key with the content key, re-encrypts and
/// re-encodes the plaintext, and compares redundancy hashes. Returns the
/// block key and ciphertext length on a match.
pub fn verify_candidate(
    block: &PlainBlock,
    candidate: &DedupCandidate,
) -> Result<Option<(BlockKey, u64)>> {
    let ks = unwrap_key(&candidate.ked, &block.kd);
    let ciphertext = encrypt_block(&block.data, &ks)?.to_bytes();
    let mode: RedundancyMode = candidate.mode;
    if mode.validate().is_err() {
        return Ok(None);
    }
    let shards = encode(&ciphertext, mode)?;
    if shard_set_hash(mode, &shards) == candidate.vhb {
        Ok(Some((ks, ciphertext.len() as u64)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::{RedundancyMode, SizeThresholdPolicy};

    fn candidate_for(block: &PlainBlock, mode: RedundancyMode) -> (DedupCandidate, BlockKey) {
        let ks = BlockKey::generate();
        let ciphertext = encrypt_block(&block.data, &ks).unwrap().to_bytes();
        let shards = encode(&ciphertext, mode).unwrap();
        (
            DedupCandidate {
                ked: wrap_key(&ks, &block.kd),
                vhb: shard_set_hash(mode, &shards),
                mode,
            },
            ks,
        )
    }

    #[test]
    fn test_candidate_verifies_for_same_content() {
        let block = PlainBlock::new(0, vec![7u8; 5000]).unwrap();
        for mode in [
            RedundancyMode::Stored,
            RedundancyMode::Copy { copies: 3 },
            RedundancyMode::Erasure { data: 3, parity: 1 },
        ] {
            let (candidate, ks) = candidate_for(&block, mode);
            let (found, real_size) = verify_candidate(&block, &candidate).unwrap().unwrap();
            assert_eq!(found, ks);
            assert_eq!(real_size, 5000 + 28);
        }
    }

    #[test]
    fn test_candidate_rejected_for_other_content() {
        let original = PlainBlock::new(0, vec![7u8; 5000]).unwrap();
        let (candidate, _) = candidate_for(&original, RedundancyMode::Erasure { data: 3, parity: 1 });

        // Same length, different bytes: KD differs, so KS unwraps to garbage
        let impostor = PlainBlock::new(0, vec![8u8; 5000]).unwrap();
        assert!(verify_candidate(&impostor, &candidate).unwrap().is_none());
    }

    #[test]
    fn test_candidate_rejected_for_forged_vhb() {
        let block = PlainBlock::new(0, vec![1u8; 100]).unwrap();
        let (mut candidate, _) = candidate_for(&block, RedundancyMode::Stored);
        candidate.vhb = ContentHash::compute(b"forged");
        assert!(verify_candidate(&block, &candidate).unwrap().is_none());
    }

    #[test]
    fn test_policy_modes_by_size() {
        let policy = SizeThresholdPolicy::default();
        assert_eq!(policy.choose(100), RedundancyMode::Stored);
        assert!(matches!(policy.choose(10_000), RedundancyMode::Copy { .. }));
        assert!(matches!(policy.choose(1 << 20), RedundancyMode::Erasure { .. }));
    }
}
