//! Configuration management for the Shardline client
//!
//! Supports loading from TOML files and `SHARDLINE_*` environment variables.

use serde::{Deserialize, Serialize};
use shardline_core::{SizeThresholdPolicy, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Process-wide admission limits
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Block splitting
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Redundancy mode selection by ciphertext size
    #[serde(default)]
    pub redundancy: SizeThresholdPolicy,

    /// Node ranking and selection
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Per-shard node interaction
    #[serde(default)]
    pub transport: TransportConfig,

    /// Per-block fan-out
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Metadata authority RPC policy
    #[serde(default)]
    pub authority: AuthorityConfig,

    /// Upload session keep-alive
    #[serde(default)]
    pub session: SessionConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = env_parse("SHARDLINE_BLOCK_SIZE") {
            self.chunking.block_size = v;
        }
        if let Some(v) = env_parse("SHARDLINE_MAX_BLOCKS") {
            self.concurrency.max_blocks = v;
        }
        if let Some(v) = env_parse("SHARDLINE_MAX_SHARD_UPLOADS") {
            self.concurrency.max_shard_uploads = v;
        }
        if let Some(v) = env_parse("SHARDLINE_MAX_SHARD_DOWNLOADS") {
            self.concurrency.max_shard_downloads = v;
        }
        if let Some(v) = env_parse("SHARDLINE_DATA_SHARDS") {
            self.redundancy.data_shards = v;
        }
        if let Some(v) = env_parse("SHARDLINE_PARITY_SHARDS") {
            self.redundancy.parity_shards = v;
        }
        if let Some(v) = env_parse("SHARDLINE_EXTRA_PERCENT") {
            self.coordinator.extra_percent = v;
        }
        if let Ok(v) = std::env::var("SHARDLINE_RANKING") {
            match v.to_lowercase().as_str() {
                "latency" => self.scheduler.ranking = RankingStrategy::Latency,
                "random" => self.scheduler.ranking = RankingStrategy::Random,
                "optimizer" => self.scheduler.ranking = RankingStrategy::Optimizer,
                other => tracing::warn!(value = other, "Unknown SHARDLINE_RANKING, ignoring"),
            }
        }
        if let Ok(v) = std::env::var("SHARDLINE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("SHARDLINE_LOG_JSON") {
            self.logging.json = v == "1" || v.to_lowercase() == "true";
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.concurrency;
        if c.max_objects == 0
            || c.max_blocks == 0
            || c.max_shard_uploads == 0
            || c.max_shard_downloads == 0
        {
            return Err(ConfigError::ValidationError(
                "concurrency limits must be > 0".to_string(),
            ));
        }

        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.chunking.block_size) {
            return Err(ConfigError::ValidationError(format!(
                "block_size must be between {} and {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }

        self.redundancy
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.scheduler.max_shards_per_node == 0 {
            return Err(ConfigError::ValidationError(
                "max_shards_per_node must be > 0".to_string(),
            ));
        }

        if self.transport.admission_retries == 0 || self.transport.max_node_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "admission_retries and max_node_attempts must be > 0".to_string(),
            ));
        }

        if self.coordinator.extra_percent > 100 {
            return Err(ConfigError::ValidationError(
                "extra_percent must be <= 100".to_string(),
            ));
        }

        if self.authority.max_commit_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_commit_attempts must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Process-wide admission limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Concurrent object uploads
    pub max_objects: usize,
    /// Concurrent blocks in flight, shared across objects
    pub max_blocks: usize,
    /// Concurrent shard uploads, shared across blocks
    pub max_shard_uploads: usize,
    /// Concurrent shard downloads
    pub max_shard_downloads: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_objects: 4,
            max_blocks: 16,
            max_shard_uploads: 128,
            max_shard_downloads: 128,
        }
    }
}

/// Block splitting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum plaintext block size in bytes
    pub block_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Node ranking policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategy {
    /// Ascending average latency
    Latency,
    /// Random order (anti-herding)
    Random,
    /// External placement optimizer, falls back to latency
    Optimizer,
}

/// Node ranking and selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub ranking: RankingStrategy,
    /// Shards of one block a single node may hold
    pub max_shards_per_node: usize,
    /// Errors beyond successes tolerated before a node leaves the ranking
    pub error_budget: u64,
    /// Ranking age that forces a rebuild
    pub refresh_interval_ms: u64,
    /// How long a caller waits for an eligible node
    pub node_wait_timeout_ms: u64,
    /// Pause between refreshes while no node is eligible
    pub wait_backoff_ms: u64,
    /// How long a `NO_SPACE` or authority-blacklisted node stays excluded
    pub blacklist_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ranking: RankingStrategy::Latency,
            max_shards_per_node: 1,
            error_budget: 5,
            refresh_interval_ms: 60_000,
            node_wait_timeout_ms: 30_000,
            wait_backoff_ms: 500,
            blacklist_ttl_secs: 600,
        }
    }
}

impl SchedulerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn node_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.node_wait_timeout_ms)
    }

    pub fn wait_backoff(&self) -> Duration {
        Duration::from_millis(self.wait_backoff_ms)
    }

    pub fn blacklist_ttl(&self) -> Duration {
        Duration::from_secs(self.blacklist_ttl_secs)
    }
}

/// Per-shard node interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity-token requests against one node before giving up on it
    pub admission_retries: u32,
    /// Delay between capacity-token requests
    pub admission_retry_delay_ms: u64,
    /// Distinct nodes tried for one shard
    pub max_node_attempts: u32,
    /// Timeout for a single node RPC
    pub shard_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            admission_retries: 3,
            admission_retry_delay_ms: 100,
            max_node_attempts: 5,
            shard_timeout_ms: 30_000,
        }
    }
}

impl TransportConfig {
    pub fn admission_retry_delay(&self) -> Duration {
        Duration::from_millis(self.admission_retry_delay_ms)
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }
}

/// Per-block fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Backup wave size as a percentage of the shard count
    pub extra_percent: u32,
    /// Delay before the backup wave starts
    pub backup_delay_ms: u64,
    /// Deadline for placing one block
    pub block_timeout_ms: u64,
    /// Successes required in erasure mode (0 = every shard)
    pub erasure_min_success: usize,
    /// Successes required in copy mode
    pub copy_min_success: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            extra_percent: 20,
            backup_delay_ms: 2_000,
            block_timeout_ms: 120_000,
            erasure_min_success: 0,
            copy_min_success: 1,
        }
    }
}

impl CoordinatorConfig {
    pub fn backup_delay(&self) -> Duration {
        Duration::from_millis(self.backup_delay_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Size of the backup wave for `total` shards
    pub fn backup_count(&self, total: usize) -> usize {
        (total * self.extra_percent as usize).div_ceil(100)
    }
}

/// Metadata authority RPC policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Retries for transient failures
    pub retries: u32,
    /// Fixed delay between attempts
    pub retry_delay_ms: u64,
    /// Commit rounds (re-placement after blacklist rejections)
    pub max_commit_attempts: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay_ms: 500,
            max_commit_attempts: 3,
        }
    }
}

impl AuthorityConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Upload session keep-alive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ping the authority when no block completed within this window
    pub keepalive_window_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_window_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn keepalive_window(&self) -> Duration {
        Duration::from_millis(self.keepalive_window_ms)
    }
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
