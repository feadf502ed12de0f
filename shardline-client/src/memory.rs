//! In-memory authority and storage nodes
//!
//! A complete single-process cluster: the authority keeps sessions, block
//! metadata with link counts and per-user references, and verifies every
//! commit; nodes store shards and sign puts. Nodes take injectable faults
//! and count their traffic, which makes the pair suitable for tests and
//! for the CLI's local simulation.

use crate::authority::MetadataAuthority;
use crate::config::ClientConfig;
use crate::model::{
    BlockCommit, BlockId, BlockLocation, CommitPayload, CommitReceipt, DedupCandidate,
    FreshBlock, NodeId, NodeStat, ObjectLocator, ObjectManifest, Reference, SessionId,
    ShardLocation, ShardPlacement, UploadInit, UserId,
};
use crate::node::{
    sign_put, verify_put, CapacityToken, NodeConnector, NodeDirectory, PutShardRequest,
    PutShardResponse, PutStatus, StorageNode,
};
use crate::{ShardlineClient, ShardlineClientBuilder};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use shardline_core::{
    redundancy_hash, ContentHash, RedundancyMode, Result, ShardlineError, WrappedKey,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

// ===== Storage node =====

/// Misbehaviour a [`MemoryNode`] can be told to exhibit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFault {
    None,
    /// Puts answer with an error status
    FailPuts,
    /// Every call blocks forever
    Hang,
    /// Puts answer `NO_SPACE`
    NoSpace,
    /// Gets return flipped bytes
    Corrupt,
    /// Gets append trailing zeros
    Padded,
    /// Capacity tokens are never writable
    DenyTokens,
    /// Every call fails at the transport level
    Offline,
    /// Puts succeed after a pause (milliseconds)
    Delay(u64),
}

pub struct MemoryNode {
    id: NodeId,
    key: SigningKey,
    fault: Mutex<NodeFault>,
    shards: RwLock<HashMap<ContentHash, Bytes>>,
    allocations: Mutex<HashSet<String>>,
    token_requests: AtomicUsize,
    puts: AtomicUsize,
    gets: AtomicUsize,
    requested: Mutex<Vec<ContentHash>>,
}

impl MemoryNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            key: SigningKey::generate(&mut OsRng),
            fault: Mutex::new(NodeFault::None),
            shards: RwLock::new(HashMap::new()),
            allocations: Mutex::new(HashSet::new()),
            token_requests: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn stat(&self) -> NodeStat {
        NodeStat::new(
            self.id.as_str(),
            format!("memory://{}", self.id),
            self.public_key(),
        )
    }

    pub fn set_fault(&self, fault: NodeFault) {
        *self.fault.lock() = fault;
    }

    fn fault(&self) -> NodeFault {
        *self.fault.lock()
    }

    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }

    /// Put attempts, including rejected ones
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Hashes requested through `get_shard`, in order
    pub fn requested(&self) -> Vec<ContentHash> {
        self.requested.lock().clone()
    }

    pub fn holds(&self, hash: &ContentHash) -> bool {
        self.shards.read().contains_key(hash)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Drop a stored shard
    pub fn evict(&self, hash: &ContentHash) -> bool {
        self.shards.write().remove(hash).is_some()
    }

    fn offline(&self) -> ShardlineError {
        ShardlineError::communication(self.id.as_str(), "connection refused")
    }

    fn response(&self, status: PutStatus, alloc_id: &str, hash: &ContentHash) -> PutShardResponse {
        PutShardResponse {
            status,
            signature: sign_put(&self.key, alloc_id, hash),
        }
    }
}

#[async_trait]
impl StorageNode for MemoryNode {
    async fn get_capacity_token(&self, _start: DateTime<Utc>, _retry: u32) -> Result<CapacityToken> {
        self.token_requests.fetch_add(1, Ordering::SeqCst);
        match self.fault() {
            NodeFault::Hang => std::future::pending().await,
            NodeFault::Offline => Err(self.offline()),
            NodeFault::DenyTokens => Ok(CapacityToken {
                writable: false,
                alloc_id: String::new(),
            }),
            _ => {
                let alloc_id = Uuid::new_v4().to_string();
                self.allocations.lock().insert(alloc_id.clone());
                Ok(CapacityToken {
                    writable: true,
                    alloc_id,
                })
            }
        }
    }

    async fn put_shard(&self, request: PutShardRequest) -> Result<PutShardResponse> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let alloc_id = request.alloc_id.as_str();
        let hash = request.hash;

        if let NodeFault::Delay(ms) = self.fault() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        match self.fault() {
            NodeFault::Hang => return std::future::pending().await,
            NodeFault::Offline => return Err(self.offline()),
            NodeFault::NoSpace => return Ok(self.response(PutStatus::NoSpace, alloc_id, &hash)),
            NodeFault::FailPuts => {
                return Ok(self.response(
                    PutStatus::Failed("injected failure".to_string()),
                    alloc_id,
                    &hash,
                ))
            }
            _ => {}
        }

        if !self.allocations.lock().remove(alloc_id) {
            return Ok(self.response(
                PutStatus::Failed(format!("unknown allocation {}", alloc_id)),
                alloc_id,
                &hash,
            ));
        }
        let requester = NodeId::new(hex::encode(&request.requester[..8]));
        if let Err(e) = verify_put(&request.requester, alloc_id, &hash, &request.signature, &requester)
        {
            return Ok(self.response(PutStatus::Failed(e.to_string()), alloc_id, &hash));
        }
        if !hash.verify(&request.data) {
            return Ok(self.response(
                PutStatus::Failed("payload does not match hash".to_string()),
                alloc_id,
                &hash,
            ));
        }

        let mut shards = self.shards.write();
        let status = if shards.contains_key(&hash) {
            PutStatus::AlreadyExists
        } else {
            shards.insert(hash, request.data);
            PutStatus::Stored
        };
        drop(shards);

        Ok(self.response(status, alloc_id, &hash))
    }

    async fn get_shard(&self, hash: ContentHash) -> Result<Option<Bytes>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().push(hash);

        let stored = self.shards.read().get(&hash).cloned();
        match self.fault() {
            NodeFault::Hang => std::future::pending().await,
            NodeFault::Offline => Err(self.offline()),
            NodeFault::Corrupt => Ok(stored.map(|data| {
                Bytes::from(data.iter().map(|b| b ^ 0xff).collect::<Vec<u8>>())
            })),
            NodeFault::Padded => Ok(stored.map(|data| {
                let mut padded = data.to_vec();
                padded.resize(data.len() + 16, 0);
                Bytes::from(padded)
            })),
            _ => Ok(stored),
        }
    }
}

// ===== Authority =====

/// Stored block metadata
#[derive(Debug, Clone)]
pub struct BlockMeta {
    pub vbi: BlockId,
    pub vhp: ContentHash,
    pub vhb: ContentHash,
    pub ked: WrappedKey,
    pub mode: RedundancyMode,
    pub shard_size: usize,
    pub real_size: u64,
    /// References pointing at this block
    pub nlink: u64,
    pub placements: Vec<ShardPlacement>,
    pub stored: Option<Bytes>,
}

struct Session {
    user: UserId,
    vhw: ContentHash,
    length: u64,
    committed: BTreeMap<u32, Reference>,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
struct ObjectRecord {
    vhw: ContentHash,
    length: u64,
    references: Vec<Reference>,
}

#[derive(Default)]
struct AuthorityState {
    next_vbi: u64,
    blocks: HashMap<BlockId, BlockMeta>,
    by_vhp: HashMap<ContentHash, Vec<BlockId>>,
    sessions: HashMap<SessionId, Session>,
    objects: HashMap<(UserId, ContentHash), ObjectRecord>,
    keys: HashMap<(UserId, String, String), Vec<(String, ContentHash)>>,
    nodes: BTreeMap<NodeId, NodeStat>,
    blacklisted: HashSet<NodeId>,
}

pub struct MemoryAuthority {
    super_id: u32,
    session_ttl: Duration,
    state: Mutex<AuthorityState>,
    commit_calls: AtomicUsize,
    dup_checks: AtomicUsize,
    keep_alives: AtomicUsize,
    finalizations: AtomicUsize,
    injected_failures: AtomicU64,
    rejected_ordinals: Mutex<HashSet<u32>>,
    block_requests: Mutex<Vec<BlockId>>,
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl MemoryAuthority {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            super_id: 1,
            session_ttl,
            state: Mutex::new(AuthorityState {
                next_vbi: 1,
                ..Default::default()
            }),
            commit_calls: AtomicUsize::new(0),
            dup_checks: AtomicUsize::new(0),
            keep_alives: AtomicUsize::new(0),
            finalizations: AtomicUsize::new(0),
            injected_failures: AtomicU64::new(0),
            rejected_ordinals: Mutex::new(HashSet::new()),
            block_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn register_node(&self, stat: NodeStat) {
        self.state.lock().nodes.insert(stat.id.clone(), stat);
    }

    /// Refuse commits that place shards on `node`
    pub fn blacklist_node(&self, node: &NodeId) {
        info!(node = %node, "Authority blacklisting node");
        self.state.lock().blacklisted.insert(node.clone());
    }

    pub fn clear_blacklist(&self) {
        self.state.lock().blacklisted.clear();
    }

    /// Fail the next `count` calls with a transient error
    pub fn inject_failures(&self, count: u64) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Refuse the next commit of `ordinal` with a permanent error
    pub fn reject_ordinal_once(&self, ordinal: u32) {
        self.rejected_ordinals.lock().insert(ordinal);
    }

    /// Drop a session as if it had timed out
    pub fn expire_session(&self, session: SessionId) {
        self.state.lock().sessions.remove(&session);
    }

    /// Publish an object under a bucket key; returns the version id
    pub fn bind_key(
        &self,
        user: UserId,
        bucket: &str,
        key: &str,
        vhw: ContentHash,
    ) -> Result<String> {
        let mut state = self.state.lock();
        if !state.objects.contains_key(&(user, vhw)) {
            return Err(ShardlineError::NotFound(format!("object {}", vhw)));
        }
        let version = Uuid::new_v4().to_string();
        state
            .keys
            .entry((user, bucket.to_string(), key.to_string()))
            .or_default()
            .push((version.clone(), vhw));
        Ok(version)
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn dup_checks(&self) -> usize {
        self.dup_checks.load(Ordering::SeqCst)
    }

    pub fn keep_alives(&self) -> usize {
        self.keep_alives.load(Ordering::SeqCst)
    }

    pub fn finalizations(&self) -> usize {
        self.finalizations.load(Ordering::SeqCst)
    }

    /// Blocks resolved through `init_download_block`, in order
    pub fn block_requests(&self) -> Vec<BlockId> {
        self.block_requests.lock().clone()
    }

    pub fn block(&self, vbi: BlockId) -> Option<BlockMeta> {
        self.state.lock().blocks.get(&vbi).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn references(&self, user: UserId, vhw: ContentHash) -> Option<Vec<Reference>> {
        self.state
            .lock()
            .objects
            .get(&(user, vhw))
            .map(|o| o.references.clone())
    }

    /// Ordinals committed so far in a session
    pub fn committed(&self, session: SessionId) -> Vec<u32> {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map(|s| s.committed.keys().copied().collect())
            .unwrap_or_default()
    }

    fn check_injected(&self) -> Result<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(ShardlineError::communication("authority", "injected failure"));
        }
        Ok(())
    }

    fn live_session<'a>(
        &self,
        state: &'a mut AuthorityState,
        session: SessionId,
    ) -> Result<&'a mut Session> {
        let expired = match state.sessions.get(&session) {
            None => return Err(ShardlineError::SessionExpired(session.to_string())),
            Some(s) => s.last_seen.elapsed() > self.session_ttl,
        };
        if expired {
            state.sessions.remove(&session);
            return Err(ShardlineError::SessionExpired(session.to_string()));
        }
        match state.sessions.get_mut(&session) {
            Some(s) => {
                s.last_seen = Instant::now();
                Ok(s)
            }
            None => Err(ShardlineError::SessionExpired(session.to_string())),
        }
    }

    fn validate_fresh(state: &AuthorityState, fresh: &FreshBlock) -> Result<()> {
        fresh.mode.validate()?;
        if fresh.shard_hashes.len() != fresh.mode.total_shards() {
            return Err(ShardlineError::Argument(format!(
                "{} shard hashes for mode {}",
                fresh.shard_hashes.len(),
                fresh.mode
            )));
        }
        let vhb = redundancy_hash(
            fresh.mode,
            fresh
                .shard_hashes
                .iter()
                .enumerate()
                .map(|(i, h)| (i as u8, *h)),
        );
        if vhb != fresh.vhb {
            return Err(ShardlineError::VerificationFailed(format!(
                "redundancy hash mismatch: got {}, computed {}",
                fresh.vhb, vhb
            )));
        }

        if !fresh.mode.is_distributed() {
            let stored = fresh.stored.as_ref().ok_or_else(|| {
                ShardlineError::Argument("stored block without ciphertext".to_string())
            })?;
            if !fresh.shard_hashes[0].verify(stored) {
                return Err(ShardlineError::VerificationFailed(
                    "stored ciphertext does not match its hash".to_string(),
                ));
            }
            return Ok(());
        }

        let distinct: HashSet<u8> = fresh.placements.iter().map(|p| p.index).collect();
        if distinct.len() < fresh.mode.min_shards() {
            return Err(ShardlineError::InsufficientRedundancy {
                placed: distinct.len(),
                required: fresh.mode.min_shards(),
            });
        }

        let blacklisted: Vec<String> = fresh
            .placements
            .iter()
            .filter(|p| state.blacklisted.contains(&p.node))
            .map(|p| p.node.to_string())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        if !blacklisted.is_empty() {
            return Err(ShardlineError::NodesBlacklisted { nodes: blacklisted });
        }

        for placement in &fresh.placements {
            let expected = fresh
                .shard_hashes
                .get(placement.index as usize)
                .ok_or_else(|| {
                    ShardlineError::Argument(format!("shard index {} out of range", placement.index))
                })?;
            if *expected != placement.hash {
                return Err(ShardlineError::VerificationFailed(format!(
                    "placement {} carries hash {}, expected {}",
                    placement.index, placement.hash, expected
                )));
            }
            let node = state.nodes.get(&placement.node).ok_or_else(|| {
                ShardlineError::NotFound(format!("storage node {}", placement.node))
            })?;
            verify_put(
                &node.public_key,
                &placement.alloc_id,
                &placement.hash,
                &placement.node_signature,
                &placement.node,
            )?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataAuthority for MemoryAuthority {
    async fn init_upload_object(
        &self,
        user: UserId,
        vhw: ContentHash,
        length: u64,
    ) -> Result<UploadInit> {
        self.check_injected()?;
        let mut state = self.state.lock();
        let ttl = self.session_ttl;

        let resumable = state
            .sessions
            .iter()
            .find(|(_, s)| s.user == user && s.vhw == vhw && s.last_seen.elapsed() <= ttl)
            .map(|(id, _)| *id);

        if let Some(id) = resumable {
            if let Some(session) = state.sessions.get_mut(&id) {
                if session.length != length {
                    return Err(ShardlineError::Argument(format!(
                        "object {} resumed with length {}, session has {}",
                        vhw, length, session.length
                    )));
                }
                session.last_seen = Instant::now();
                debug!(session = %id, committed = session.committed.len(), "Resuming upload session");
                return Ok(UploadInit {
                    session: id,
                    committed: session.committed.keys().copied().collect(),
                    resumed: true,
                });
            }
        }

        let id = SessionId::new();
        state.sessions.insert(
            id,
            Session {
                user,
                vhw,
                length,
                committed: BTreeMap::new(),
                last_seen: Instant::now(),
            },
        );
        debug!(session = %id, %user, vhw = %vhw, length, "Upload session opened");
        Ok(UploadInit {
            session: id,
            committed: Vec::new(),
            resumed: false,
        })
    }

    async fn check_block_dup(
        &self,
        session: SessionId,
        vhp: ContentHash,
    ) -> Result<Vec<DedupCandidate>> {
        self.check_injected()?;
        self.dup_checks.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        self.live_session(&mut state, session)?;

        let candidates = state
            .by_vhp
            .get(&vhp)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.blocks.get(id))
                    .map(|meta| DedupCandidate {
                        ked: meta.ked,
                        vhb: meta.vhb,
                        mode: meta.mode,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(candidates)
    }

    async fn commit_block(&self, commit: BlockCommit) -> Result<CommitReceipt> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        self.check_injected()?;
        if self.rejected_ordinals.lock().remove(&commit.ordinal) {
            return Err(ShardlineError::Argument(format!(
                "commit of ordinal {} refused",
                commit.ordinal
            )));
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.live_session(state, commit.session)?;

        let vhb = match &commit.payload {
            CommitPayload::Duplicate { vhb } => *vhb,
            CommitPayload::Fresh(fresh) => {
                Self::validate_fresh(state, fresh)?;
                fresh.vhb
            }
        };

        let existing = state.by_vhp.get(&commit.vhp).and_then(|ids| {
            ids.iter()
                .copied()
                .find(|id| state.blocks.get(id).map(|m| m.vhb) == Some(vhb))
        });

        let (vbi, deduplicated) = match (existing, &commit.payload) {
            (Some(vbi), _) => {
                if let Some(meta) = state.blocks.get_mut(&vbi) {
                    meta.nlink += 1;
                }
                (vbi, true)
            }
            (None, CommitPayload::Duplicate { .. }) => {
                return Err(ShardlineError::NotFound(format!(
                    "no block with VHP {} and VHB {}",
                    commit.vhp, vhb
                )));
            }
            (None, CommitPayload::Fresh(fresh)) => {
                let vbi = BlockId(state.next_vbi);
                state.next_vbi += 1;
                state.blocks.insert(
                    vbi,
                    BlockMeta {
                        vbi,
                        vhp: commit.vhp,
                        vhb: fresh.vhb,
                        ked: fresh.ked,
                        mode: fresh.mode,
                        shard_size: fresh.shard_size,
                        real_size: commit.real_size,
                        nlink: 1,
                        placements: fresh.placements.clone(),
                        stored: fresh.stored.clone(),
                    },
                );
                state.by_vhp.entry(commit.vhp).or_default().push(vbi);
                (vbi, false)
            }
        };

        let reference = Reference {
            vbi,
            super_id: self.super_id,
            original_size: commit.original_size,
            real_size: commit.real_size,
            keu: commit.keu,
            key_version: commit.key_version,
            ordinal: commit.ordinal,
        };
        if let Some(session) = state.sessions.get_mut(&commit.session) {
            session.committed.insert(commit.ordinal, reference);
        }

        debug!(
            session = %commit.session,
            ordinal = commit.ordinal,
            vbi = %vbi,
            deduplicated,
            "Block committed"
        );
        Ok(CommitReceipt {
            vbi,
            super_id: self.super_id,
            deduplicated,
        })
    }

    async fn finalize_object(&self, session: SessionId, vhw: ContentHash) -> Result<()> {
        self.check_injected()?;
        let mut state = self.state.lock();
        let live = self.live_session(&mut state, session)?;
        if live.vhw != vhw {
            return Err(ShardlineError::Argument(format!(
                "session {} is for object {}, not {}",
                session, live.vhw, vhw
            )));
        }

        let references: Vec<Reference> = live.committed.values().cloned().collect();
        let gapless = references
            .iter()
            .enumerate()
            .all(|(i, r)| r.ordinal as usize == i);
        let covered: u64 = references.iter().map(|r| r.original_size).sum();
        if !gapless || covered != live.length {
            return Err(ShardlineError::Argument(format!(
                "object incomplete: {} of {} bytes in {} blocks",
                covered,
                live.length,
                references.len()
            )));
        }

        let record = ObjectRecord {
            vhw,
            length: live.length,
            references,
        };
        let user = live.user;
        state.sessions.remove(&session);
        state.objects.insert((user, vhw), record);
        self.finalizations.fetch_add(1, Ordering::SeqCst);
        info!(session = %session, vhw = %vhw, "Object finalized");
        Ok(())
    }

    async fn init_download_object(
        &self,
        user: UserId,
        locator: ObjectLocator,
    ) -> Result<ObjectManifest> {
        self.check_injected()?;
        let state = self.state.lock();
        let vhw = match &locator {
            ObjectLocator::Hash { vhw } => *vhw,
            ObjectLocator::Key {
                bucket,
                key,
                version,
            } => {
                let versions = state
                    .keys
                    .get(&(user, bucket.clone(), key.clone()))
                    .ok_or_else(|| ShardlineError::NotFound(locator.to_string()))?;
                let found = match version {
                    Some(v) => versions.iter().find(|(id, _)| id == v),
                    None => versions.last(),
                };
                found
                    .map(|(_, vhw)| *vhw)
                    .ok_or_else(|| ShardlineError::NotFound(locator.to_string()))?
            }
        };

        let record = state
            .objects
            .get(&(user, vhw))
            .ok_or_else(|| ShardlineError::NotFound(locator.to_string()))?;
        Ok(ObjectManifest {
            vhw: record.vhw,
            length: record.length,
            references: record.references.clone(),
        })
    }

    async fn init_download_block(&self, vbi: BlockId) -> Result<BlockLocation> {
        self.check_injected()?;
        self.block_requests.lock().push(vbi);
        let state = self.state.lock();
        let meta = state
            .blocks
            .get(&vbi)
            .ok_or_else(|| ShardlineError::NotFound(format!("block {}", vbi)))?;

        if let Some(data) = &meta.stored {
            return Ok(BlockLocation::Stored { data: data.clone() });
        }

        let shards = meta
            .placements
            .iter()
            .filter_map(|p| {
                state.nodes.get(&p.node).map(|node| ShardLocation {
                    index: p.index,
                    hash: p.hash,
                    node: node.clone(),
                })
            })
            .collect();
        Ok(BlockLocation::Sharded {
            mode: meta.mode,
            shard_size: meta.shard_size,
            shards,
        })
    }

    async fn keep_alive(&self, session: SessionId) -> Result<()> {
        self.keep_alives.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        self.live_session(&mut state, session).map(|_| ())
    }
}

#[async_trait]
impl NodeDirectory for MemoryAuthority {
    async fn snapshot(&self) -> Result<Vec<NodeStat>> {
        let state = self.state.lock();
        Ok(state.nodes.values().cloned().collect())
    }
}

// ===== Cluster =====

/// Authority plus nodes, wired as directory and connector
#[derive(Clone)]
pub struct MemoryCluster {
    authority: Arc<MemoryAuthority>,
    nodes: Arc<Vec<Arc<MemoryNode>>>,
}

impl MemoryCluster {
    /// Cluster with `size` healthy nodes named `node-00`, `node-01`, ...
    pub fn new(size: usize) -> Self {
        Self::with_authority(Arc::new(MemoryAuthority::default()), size)
    }

    pub fn with_authority(authority: Arc<MemoryAuthority>, size: usize) -> Self {
        let nodes: Vec<Arc<MemoryNode>> = (0..size)
            .map(|i| Arc::new(MemoryNode::new(format!("node-{:02}", i))))
            .collect();
        for node in &nodes {
            authority.register_node(node.stat());
        }
        Self {
            authority,
            nodes: Arc::new(nodes),
        }
    }

    pub fn authority(&self) -> Arc<MemoryAuthority> {
        self.authority.clone()
    }

    /// Client wired to this cluster
    pub fn client(&self, config: ClientConfig) -> Result<ShardlineClient> {
        self.builder(config).build()
    }

    pub fn builder(&self, config: ClientConfig) -> ShardlineClientBuilder {
        ShardlineClient::builder(
            config,
            self.authority.clone(),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    pub fn node(&self, index: usize) -> &Arc<MemoryNode> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Arc<MemoryNode>] {
        &self.nodes
    }

    pub fn find(&self, id: &NodeId) -> Option<Arc<MemoryNode>> {
        self.nodes.iter().find(|n| n.id() == id).cloned()
    }

    pub fn stat(&self, id: &NodeId) -> Option<NodeStat> {
        self.find(id).map(|n| n.stat())
    }

    pub fn total_puts(&self) -> usize {
        self.nodes.iter().map(|n| n.puts()).sum()
    }

    pub fn total_gets(&self) -> usize {
        self.nodes.iter().map(|n| n.gets()).sum()
    }

    /// Every hash requested from any node
    pub fn requested(&self) -> HashSet<ContentHash> {
        self.nodes.iter().flat_map(|n| n.requested()).collect()
    }
}

#[async_trait]
impl NodeConnector for MemoryCluster {
    async fn connect(&self, node: &NodeStat) -> Result<Arc<dyn StorageNode>> {
        self.find(&node.id)
            .map(|n| n as Arc<dyn StorageNode>)
            .ok_or_else(|| ShardlineError::communication(node.id.as_str(), "unknown node"))
    }
}

#[async_trait]
impl NodeDirectory for MemoryCluster {
    async fn snapshot(&self) -> Result<Vec<NodeStat>> {
        self.authority.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::{encode, shard_set_hash, wrap_key, BlockKey};

    fn signing_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    async fn put(node: &MemoryNode, data: &'static [u8]) -> PutShardResponse {
        let requester = signing_key();
        let hash = ContentHash::compute(data);
        let token = node.get_capacity_token(Utc::now(), 0).await.unwrap();
        node.put_shard(PutShardRequest {
            alloc_id: token.alloc_id.clone(),
            index: 0,
            data: Bytes::from_static(data),
            hash,
            requester: requester.verifying_key().to_bytes(),
            signature: sign_put(&requester, &token.alloc_id, &hash),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_node_put_is_idempotent() {
        let node = MemoryNode::new("n1");
        assert_eq!(put(&node, b"shard").await.status, PutStatus::Stored);
        assert_eq!(put(&node, b"shard").await.status, PutStatus::AlreadyExists);
        assert_eq!(node.shard_count(), 1);

        let fetched = node.get_shard(ContentHash::compute(b"shard")).await.unwrap();
        assert_eq!(fetched.as_deref(), Some(&b"shard"[..]));
    }

    #[tokio::test]
    async fn test_node_rejects_unknown_allocation() {
        let node = MemoryNode::new("n1");
        let requester = signing_key();
        let hash = ContentHash::compute(b"x");
        let response = node
            .put_shard(PutShardRequest {
                alloc_id: "forged".to_string(),
                index: 0,
                data: Bytes::from_static(b"x"),
                hash,
                requester: requester.verifying_key().to_bytes(),
                signature: sign_put(&requester, "forged", &hash),
            })
            .await
            .unwrap();
        assert!(matches!(response.status, PutStatus::Failed(_)));
        assert_eq!(node.shard_count(), 0);
    }

    #[tokio::test]
    async fn test_node_signature_verifies() {
        let node = MemoryNode::new("n1");
        let hash = ContentHash::compute(b"shard");
        let token = node.get_capacity_token(Utc::now(), 0).await.unwrap();
        let requester = signing_key();
        let response = node
            .put_shard(PutShardRequest {
                alloc_id: token.alloc_id.clone(),
                index: 0,
                data: Bytes::from_static(b"shard"),
                hash,
                requester: requester.verifying_key().to_bytes(),
                signature: sign_put(&requester, &token.alloc_id, &hash),
            })
            .await
            .unwrap();
        assert!(verify_put(
            &node.public_key(),
            &token.alloc_id,
            &hash,
            &response.signature,
            node.id()
        )
        .is_ok());
    }

    fn stored_commit(session: SessionId, ordinal: u32, ciphertext: &'static [u8]) -> BlockCommit {
        let mode = RedundancyMode::Stored;
        let shards = encode(ciphertext, mode).unwrap();
        let key = BlockKey::generate();
        BlockCommit {
            session,
            ordinal,
            vhp: ContentHash::compute(b"plaintext"),
            keu: wrap_key(&key, &BlockKey::generate()),
            key_version: 1,
            original_size: ciphertext.len() as u64,
            real_size: ciphertext.len() as u64,
            payload: CommitPayload::Fresh(FreshBlock {
                vhb: shard_set_hash(mode, &shards),
                ked: wrap_key(&key, &BlockKey::generate()),
                mode,
                shard_hashes: shards.iter().map(|s| s.hash).collect(),
                shard_size: ciphertext.len(),
                placements: Vec::new(),
                stored: Some(Bytes::from_static(ciphertext)),
            }),
        }
    }

    #[tokio::test]
    async fn test_session_resume_lists_committed() {
        let authority = MemoryAuthority::default();
        let vhw = ContentHash::compute(b"object");
        let init = authority.init_upload_object(UserId(1), vhw, 10).await.unwrap();
        assert!(!init.resumed);

        // Reopened before any block committed: same session, nothing to skip
        let early = authority.init_upload_object(UserId(1), vhw, 10).await.unwrap();
        assert_eq!(early.session, init.session);
        assert!(early.resumed);
        assert!(early.committed.is_empty());

        authority
            .commit_block(stored_commit(init.session, 0, b"0123456789"))
            .await
            .unwrap();

        let resumed = authority.init_upload_object(UserId(1), vhw, 10).await.unwrap();
        assert_eq!(resumed.session, init.session);
        assert!(resumed.resumed);
        assert_eq!(resumed.committed, vec![0]);

        let other_user = authority.init_upload_object(UserId(2), vhw, 10).await.unwrap();
        assert_ne!(other_user.session, init.session);
        assert!(!other_user.resumed);
    }

    #[tokio::test]
    async fn test_expired_session_rejected() {
        let authority = MemoryAuthority::default();
        let vhw = ContentHash::compute(b"object");
        let init = authority.init_upload_object(UserId(1), vhw, 10).await.unwrap();
        authority.expire_session(init.session);

        let result = authority
            .commit_block(stored_commit(init.session, 0, b"0123456789"))
            .await;
        assert!(matches!(result, Err(ShardlineError::SessionExpired(_))));
        assert!(authority.keep_alive(init.session).await.is_err());
    }

    #[tokio::test]
    async fn test_vhb_mismatch_rejected() {
        let authority = MemoryAuthority::default();
        let init = authority
            .init_upload_object(UserId(1), ContentHash::compute(b"o"), 10)
            .await
            .unwrap();
        let mut commit = stored_commit(init.session, 0, b"0123456789");
        if let CommitPayload::Fresh(fresh) = &mut commit.payload {
            fresh.vhb = ContentHash::compute(b"forged");
        }
        assert!(matches!(
            authority.commit_block(commit).await,
            Err(ShardlineError::VerificationFailed(_))
        ));
        assert_eq!(authority.block_count(), 0);
    }

    #[tokio::test]
    async fn test_finalize_requires_full_coverage() {
        let authority = MemoryAuthority::default();
        let vhw = ContentHash::compute(b"object");
        let init = authority.init_upload_object(UserId(1), vhw, 20).await.unwrap();
        authority
            .commit_block(stored_commit(init.session, 0, b"0123456789"))
            .await
            .unwrap();
        assert!(authority.finalize_object(init.session, vhw).await.is_err());

        authority
            .commit_block(stored_commit(init.session, 1, b"abcdefghij"))
            .await
            .unwrap();
        authority.finalize_object(init.session, vhw).await.unwrap();

        let refs = authority.references(UserId(1), vhw).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(authority.finalizations(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let authority = MemoryAuthority::default();
        authority.inject_failures(1);
        let vhw = ContentHash::compute(b"object");
        let first = authority.init_upload_object(UserId(1), vhw, 1).await;
        assert!(first.unwrap_err().is_retryable());
        assert!(authority.init_upload_object(UserId(1), vhw, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_key_versions() {
        let authority = MemoryAuthority::default();
        let vhw = ContentHash::compute(b"object");
        let init = authority.init_upload_object(UserId(1), vhw, 10).await.unwrap();
        authority
            .commit_block(stored_commit(init.session, 0, b"0123456789"))
            .await
            .unwrap();
        authority.finalize_object(init.session, vhw).await.unwrap();

        let version = authority.bind_key(UserId(1), "docs", "a.txt", vhw).unwrap();
        let latest = authority
            .init_download_object(UserId(1), ObjectLocator::key("docs", "a.txt"))
            .await
            .unwrap();
        assert_eq!(latest.length, 10);

        let pinned = authority
            .init_download_object(
                UserId(1),
                ObjectLocator::Key {
                    bucket: "docs".into(),
                    key: "a.txt".into(),
                    version: Some(version),
                },
            )
            .await
            .unwrap();
        assert_eq!(pinned.vhw, vhw);

        assert!(authority
            .init_download_object(UserId(2), ObjectLocator::hash(vhw))
            .await
            .is_err());
    }
}
