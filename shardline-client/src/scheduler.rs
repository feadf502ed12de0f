//! Node scheduler
//!
//! Ranks storage nodes from directory snapshots and hands them out in
//! rotation. A ranking is immutable once built and swapped in whole on
//! refresh; readers clone the `Arc` and never observe a half-built list.
//! Outcome counters live beside the ranking in atomics so recording a
//! success or failure never touches a snapshot.
//!
//! Lifecycle: stale -> refreshed -> ranked -> exhausted -> refreshed.

use crate::blacklist::NodeBlacklist;
use crate::config::{RankingStrategy, SchedulerConfig};
use crate::model::{NodeId, NodeStat};
use crate::node::NodeDirectory;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use shardline_core::{Result, ShardlineError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Live outcome counters for one node
#[derive(Debug, Default)]
pub struct NodeHealth {
    ok: AtomicU64,
    errors: AtomicU64,
    latency_ms: AtomicU64,
}

impl NodeHealth {
    fn seeded(stat: &NodeStat) -> Self {
        Self {
            ok: AtomicU64::new(stat.ok_times),
            errors: AtomicU64::new(stat.error_times),
            latency_ms: AtomicU64::new(stat.total_latency_ms),
        }
    }

    pub fn ok_times(&self) -> u64 {
        self.ok.load(Ordering::Relaxed)
    }

    pub fn error_times(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> u64 {
        let ok = self.ok_times();
        if ok == 0 {
            0
        } else {
            self.latency_ms.load(Ordering::Relaxed) / ok
        }
    }

    /// Errors outrun successes by more than the budget
    pub fn is_saturated(&self, error_budget: u64) -> bool {
        self.error_times() > self.ok_times().saturating_add(error_budget)
    }
}

/// Input to a ranking policy
#[derive(Debug, Clone)]
pub struct NodeSample {
    pub id: NodeId,
    pub avg_latency_ms: u64,
    pub ok_times: u64,
    pub error_times: u64,
}

/// Orders eligible nodes; `None` defers to latency ranking
pub trait RankingPolicy: Send + Sync {
    fn rank(&self, nodes: &[NodeSample]) -> Option<Vec<NodeId>>;
}

/// Ascending average latency, ties broken by id
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyRanking;

impl RankingPolicy for LatencyRanking {
    fn rank(&self, nodes: &[NodeSample]) -> Option<Vec<NodeId>> {
        let mut sorted: Vec<&NodeSample> = nodes.iter().collect();
        sorted.sort_by(|a, b| {
            a.avg_latency_ms
                .cmp(&b.avg_latency_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Some(sorted.into_iter().map(|n| n.id.clone()).collect())
    }
}

/// Uniformly shuffled order
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomRanking;

impl RankingPolicy for RandomRanking {
    fn rank(&self, nodes: &[NodeSample]) -> Option<Vec<NodeId>> {
        let mut ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        ids.shuffle(&mut rand::thread_rng());
        Some(ids)
    }
}

/// External placement optimizer
pub trait PlacementOptimizer: Send + Sync {
    /// Preferred node order, or `None` when the optimizer has no answer
    fn suggest(&self, nodes: &[NodeSample]) -> Option<Vec<NodeId>>;
}

/// Ranking delegated to a [`PlacementOptimizer`]
pub struct OptimizerRanking {
    optimizer: Arc<dyn PlacementOptimizer>,
}

impl OptimizerRanking {
    pub fn new(optimizer: Arc<dyn PlacementOptimizer>) -> Self {
        Self { optimizer }
    }
}

impl RankingPolicy for OptimizerRanking {
    fn rank(&self, nodes: &[NodeSample]) -> Option<Vec<NodeId>> {
        self.optimizer.suggest(nodes).filter(|order| !order.is_empty())
    }
}

/// Build the policy named by the configuration
pub fn ranking_policy(
    strategy: RankingStrategy,
    optimizer: Option<Arc<dyn PlacementOptimizer>>,
) -> Arc<dyn RankingPolicy> {
    match (strategy, optimizer) {
        (RankingStrategy::Latency, _) => Arc::new(LatencyRanking),
        (RankingStrategy::Random, _) => Arc::new(RandomRanking),
        (RankingStrategy::Optimizer, Some(optimizer)) => Arc::new(OptimizerRanking::new(optimizer)),
        (RankingStrategy::Optimizer, None) => {
            warn!("Optimizer ranking configured without an optimizer, using latency");
            Arc::new(LatencyRanking)
        }
    }
}

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingState {
    /// No ranking, or older than the refresh interval
    Stale,
    /// Ranking built, nothing handed out yet
    Refreshed,
    /// Rotation in progress
    Ranked,
    /// Every node handed out at least once since the last refresh
    Exhausted,
}

/// Immutable ranked snapshot
struct Ranking {
    nodes: Vec<Arc<NodeStat>>,
    built_at: Instant,
    cursor: AtomicUsize,
}

impl Ranking {
    fn is_exhausted(&self) -> bool {
        self.nodes.is_empty() || self.cursor.load(Ordering::Relaxed) >= self.nodes.len()
    }
}

pub struct NodeScheduler {
    directory: Arc<dyn NodeDirectory>,
    policy: Arc<dyn RankingPolicy>,
    blacklist: NodeBlacklist,
    config: SchedulerConfig,
    ranking: RwLock<Option<Arc<Ranking>>>,
    health: RwLock<HashMap<NodeId, Arc<NodeHealth>>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl NodeScheduler {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        policy: Arc<dyn RankingPolicy>,
        blacklist: NodeBlacklist,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            directory,
            policy,
            blacklist,
            config,
            ranking: RwLock::new(None),
            health: RwLock::new(HashMap::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn blacklist(&self) -> &NodeBlacklist {
        &self.blacklist
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> RankingState {
        match self.current() {
            None => RankingState::Stale,
            Some(r) if r.built_at.elapsed() >= self.config.refresh_interval() => {
                RankingState::Stale
            }
            Some(r) if r.is_exhausted() => RankingState::Exhausted,
            Some(r) if r.cursor.load(Ordering::Relaxed) == 0 => RankingState::Refreshed,
            Some(_) => RankingState::Ranked,
        }
    }

    /// Node ids of the current ranking, in order
    pub fn ranked_nodes(&self) -> Vec<NodeId> {
        self.current()
            .map(|r| r.nodes.iter().map(|n| n.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn health(&self, node: &NodeId) -> Option<Arc<NodeHealth>> {
        self.health.read().get(node).cloned()
    }

    fn current(&self) -> Option<Arc<Ranking>> {
        self.ranking.read().clone()
    }

    /// Called when a block starts placing shards
    pub async fn begin_block(&self) -> Result<()> {
        match self.state() {
            RankingState::Stale | RankingState::Exhausted => self.refresh().await,
            RankingState::Refreshed | RankingState::Ranked => Ok(()),
        }
    }

    /// Rebuild the ranking from a fresh directory snapshot
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        // Another caller refreshed while we waited
        if matches!(
            self.state(),
            RankingState::Refreshed | RankingState::Ranked
        ) {
            return Ok(());
        }

        let snapshot = self.directory.snapshot().await?;
        let total = snapshot.len();

        let health = {
            let previous = self.health.read();
            snapshot
                .iter()
                .map(|stat| {
                    let counters = previous
                        .get(&stat.id)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(NodeHealth::seeded(stat)));
                    (stat.id.clone(), counters)
                })
                .collect::<HashMap<_, _>>()
        };

        let mut by_id: HashMap<NodeId, Arc<NodeStat>> = HashMap::new();
        let mut samples = Vec::new();
        for stat in snapshot {
            if self.blacklist.contains(&stat.id) {
                continue;
            }
            let Some(counters) = health.get(&stat.id) else {
                continue;
            };
            if counters.is_saturated(self.config.error_budget) {
                debug!(node = %stat.id, errors = counters.error_times(), "Node over error budget");
                continue;
            }
            samples.push(NodeSample {
                id: stat.id.clone(),
                avg_latency_ms: counters.avg_latency_ms(),
                ok_times: counters.ok_times(),
                error_times: counters.error_times(),
            });
            by_id.insert(stat.id.clone(), Arc::new(stat));
        }

        let order = self
            .policy
            .rank(&samples)
            .or_else(|| LatencyRanking.rank(&samples))
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let nodes: Vec<Arc<NodeStat>> = order
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .filter_map(|id| by_id.get(&id).cloned())
            .collect();

        info!(total, eligible = nodes.len(), "Node ranking refreshed");

        *self.health.write() = health;
        *self.ranking.write() = Some(Arc::new(Ranking {
            nodes,
            built_at: Instant::now(),
            cursor: AtomicUsize::new(0),
        }));
        Ok(())
    }

    /// Next node in rotation accepted by `accept`.
    ///
    /// Blacklisted and saturated nodes are skipped. When a full rotation
    /// finds nothing the ranking is refreshed after a backoff, until the
    /// node wait timeout elapses.
    pub async fn next_node<F>(&self, accept: F) -> Result<Arc<NodeStat>>
    where
        F: FnMut(&NodeStat) -> bool + Send,
    {
        self.next_node_from(None, accept).await
    }

    /// [`next_node`](Self::next_node), scanning from a caller-owned cursor.
    ///
    /// Each call claims one start position from `cursor` and scans the
    /// whole ranking from there, so concurrent callers with their own
    /// cursors never push each other past eligible nodes. Without one the
    /// scan starts at the ranking's shared position.
    pub async fn next_node_from<F>(
        &self,
        cursor: Option<&AtomicUsize>,
        mut accept: F,
    ) -> Result<Arc<NodeStat>>
    where
        F: FnMut(&NodeStat) -> bool + Send,
    {
        let started = Instant::now();
        let deadline = started + self.config.node_wait_timeout();

        loop {
            if let Some(ranking) = self.current() {
                let len = ranking.nodes.len();
                if len > 0 {
                    let start = match cursor {
                        Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
                        None => ranking.cursor.load(Ordering::Relaxed),
                    };
                    for step in 0..len {
                        let node = &ranking.nodes[start.wrapping_add(step) % len];
                        if self.blacklist.contains(&node.id) || self.is_saturated(&node.id) {
                            continue;
                        }
                        if accept(node) {
                            // The shared position counts hand-outs toward exhaustion
                            ranking.cursor.fetch_add(1, Ordering::Relaxed);
                            return Ok(node.clone());
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, "No eligible storage node");
                return Err(ShardlineError::NoEligibleNode { waited_ms });
            }

            let pause = self.config.wait_backoff().min(deadline - now);
            debug!(pause_ms = pause.as_millis() as u64, "No eligible node, refreshing ranking");
            tokio::time::sleep(pause).await;
            self.invalidate();
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "Node directory refresh failed");
            }
        }
    }

    /// Current shared rotation position
    fn rotation_position(&self) -> usize {
        self.current()
            .map(|r| r.cursor.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Mark the current ranking stale
    pub fn invalidate(&self) {
        *self.ranking.write() = None;
    }

    pub fn record_success(&self, node: &NodeId, latency: Duration) {
        if let Some(health) = self.health(node) {
            health.ok.fetch_add(1, Ordering::Relaxed);
            health
                .latency_ms
                .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// Count a failure; returns whether the node is now saturated
    pub fn record_failure(&self, node: &NodeId) -> bool {
        match self.health(node) {
            Some(health) => {
                health.errors.fetch_add(1, Ordering::Relaxed);
                health.is_saturated(self.config.error_budget)
            }
            None => false,
        }
    }

    pub fn is_saturated(&self, node: &NodeId) -> bool {
        self.health(node)
            .map(|h| h.is_saturated(self.config.error_budget))
            .unwrap_or(false)
    }
}

/// Node selection state for one block.
///
/// Enforces the per-node shard quota and the block-wide exclusion set
/// shared by every shard task of the block. Rotation runs on the
/// allocator's own cursor, seeded from the scheduler's position.
pub struct BlockAllocator {
    scheduler: Arc<NodeScheduler>,
    quota: usize,
    cursor: AtomicUsize,
    state: Mutex<AllocatorState>,
}

#[derive(Default)]
struct AllocatorState {
    claims: HashMap<NodeId, usize>,
    excluded: HashSet<NodeId>,
}

impl BlockAllocator {
    pub fn new(scheduler: Arc<NodeScheduler>) -> Self {
        let quota = scheduler.config().max_shards_per_node;
        let cursor = AtomicUsize::new(scheduler.rotation_position());
        Self {
            scheduler,
            quota,
            cursor,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    pub fn scheduler(&self) -> &Arc<NodeScheduler> {
        &self.scheduler
    }

    /// Claim the next node not in `tried` and under quota
    pub async fn next_node(&self, tried: &HashSet<NodeId>) -> Result<Arc<NodeStat>> {
        self.scheduler
            .next_node_from(Some(&self.cursor), |node| {
                if tried.contains(&node.id) {
                    return false;
                }
                let mut state = self.state.lock();
                if state.excluded.contains(&node.id) {
                    return false;
                }
                let claimed = state.claims.entry(node.id.clone()).or_insert(0);
                if *claimed >= self.quota {
                    return false;
                }
                *claimed += 1;
                true
            })
            .await
    }

    /// Return a claim after a failed attempt
    pub fn release(&self, node: &NodeId) {
        let mut state = self.state.lock();
        if let Some(claimed) = state.claims.get_mut(node) {
            *claimed = claimed.saturating_sub(1);
        }
    }

    /// Keep `node` out of the rest of this block
    pub fn exclude(&self, node: &NodeId) {
        self.state.lock().excluded.insert(node.clone());
    }

    pub fn is_excluded(&self, node: &NodeId) -> bool {
        self.state.lock().excluded.contains(node)
    }
}
