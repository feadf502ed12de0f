//! Shardline Client
//!
//! Client-side data path of the Shardline object store:
//! - Node scheduling with copy-on-write rankings and a TTL blacklist
//! - Shard transport with capacity admission and signed puts
//! - Fan-out/fan-in placement with a delayed backup wave
//! - Block and object upload orchestration with deduplication
//! - Range downloads reconstructed from the minimum shard set
//!
//! The metadata authority and storage nodes are reached through the
//! [`MetadataAuthority`], [`StorageNode`], [`NodeConnector`] and
//! [`NodeDirectory`] traits. [`memory`] provides in-process
//! implementations of all four.

pub mod authority;
pub mod blacklist;
pub mod block;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod memory;
pub mod model;
pub mod node;
pub mod object;
pub mod pool;
pub mod scheduler;
pub mod telemetry;
pub mod transport;

pub use authority::{MetadataAuthority, RetryingAuthority};
pub use blacklist::{BlacklistReason, NodeBlacklist};
pub use block::{BlockReceipt, BlockUploader};
pub use config::{ClientConfig, ConfigError, RankingStrategy};
pub use coordinator::ShardCoordinator;
pub use download::{BlockFetcher, ByteRange, ObjectDownloader, ObjectReader};
pub use model::{
    BlockId, NodeId, NodeStat, ObjectLocator, ObjectManifest, Reference, SessionId, UserId,
};
pub use node::{NodeConnector, NodeDirectory, StorageNode};
pub use object::{ObjectReceipt, ObjectUploader};
pub use pool::ResourcePools;
pub use scheduler::{NodeScheduler, PlacementOptimizer, RankingPolicy};
pub use telemetry::init_tracing;
pub use transport::ShardTransport;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use shardline_core::{BlockKey, RedundancyPolicy, Result, ShardlineError};
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use std::sync::Arc;

/// A user's identity and key material
pub struct UserCredentials {
    pub user_id: UserId,
    /// Key that wraps every block key for this user (`KEU`)
    pub key: BlockKey,
    pub key_version: u32,
}

impl UserCredentials {
    pub fn new(user_id: UserId, key: BlockKey) -> Self {
        Self {
            user_id,
            key,
            key_version: 1,
        }
    }

    /// Derive the user key from a password with Argon2
    pub fn from_password(user_id: UserId, password: &[u8], salt: &[u8]) -> Result<Self> {
        Ok(Self::new(user_id, BlockKey::derive_from_password(password, salt)?))
    }

    pub fn with_key_version(mut self, version: u32) -> Self {
        self.key_version = version;
        self
    }
}

impl std::fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredentials")
            .field("user_id", &self.user_id)
            .field("key_version", &self.key_version)
            .finish()
    }
}

/// Upload and download entry point
pub struct ShardlineClient {
    config: ClientConfig,
    pools: ResourcePools,
    scheduler: Arc<NodeScheduler>,
    uploader: ObjectUploader,
    downloader: ObjectDownloader,
}

impl ShardlineClient {
    pub fn builder(
        config: ClientConfig,
        authority: Arc<dyn MetadataAuthority>,
        directory: Arc<dyn NodeDirectory>,
        connector: Arc<dyn NodeConnector>,
    ) -> ShardlineClientBuilder {
        ShardlineClientBuilder {
            config,
            authority,
            directory,
            connector,
            optimizer: None,
            redundancy: None,
            pools: None,
            signing_key: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pools(&self) -> &ResourcePools {
        &self.pools
    }

    pub fn scheduler(&self) -> &Arc<NodeScheduler> {
        &self.scheduler
    }

    /// Upload a seekable stream as one object
    pub async fn upload<R>(&self, user: Arc<UserCredentials>, reader: R) -> Result<ObjectReceipt>
    where
        R: Read + Seek + Send + 'static,
    {
        self.uploader.upload(user, reader).await
    }

    pub async fn upload_bytes(
        &self,
        user: Arc<UserCredentials>,
        data: impl Into<Bytes>,
    ) -> Result<ObjectReceipt> {
        self.upload(user, Cursor::new(data.into())).await
    }

    pub async fn upload_file(
        &self,
        user: Arc<UserCredentials>,
        path: impl AsRef<Path>,
    ) -> Result<ObjectReceipt> {
        let file = tokio::fs::File::open(path).await?.into_std().await;
        self.upload(user, file).await
    }

    /// Open a byte range of an object for reading
    pub async fn open(
        &self,
        user: &UserCredentials,
        locator: ObjectLocator,
        range: ByteRange,
    ) -> Result<ObjectReader> {
        self.downloader
            .open(user.user_id, &user.key, locator, range)
            .await
    }

    /// Read a whole object into memory
    pub async fn download(&self, user: &UserCredentials, locator: ObjectLocator) -> Result<Vec<u8>> {
        self.open(user, locator, ByteRange::full())
            .await?
            .read_to_end()
            .await
    }
}

pub struct ShardlineClientBuilder {
    config: ClientConfig,
    authority: Arc<dyn MetadataAuthority>,
    directory: Arc<dyn NodeDirectory>,
    connector: Arc<dyn NodeConnector>,
    optimizer: Option<Arc<dyn PlacementOptimizer>>,
    redundancy: Option<Arc<dyn RedundancyPolicy>>,
    pools: Option<ResourcePools>,
    signing_key: Option<SigningKey>,
}

impl ShardlineClientBuilder {
    /// Optimizer consulted when ranking is `optimizer`
    pub fn optimizer(mut self, optimizer: Arc<dyn PlacementOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Replace the configured size-threshold policy
    pub fn redundancy_policy(mut self, policy: Arc<dyn RedundancyPolicy>) -> Self {
        self.redundancy = Some(policy);
        self
    }

    /// Share admission limits with other clients
    pub fn pools(mut self, pools: ResourcePools) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Key used to sign shard puts
    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn build(self) -> Result<ShardlineClient> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| ShardlineError::Configuration(e.to_string()))?;

        let pools = self
            .pools
            .unwrap_or_else(|| ResourcePools::new(&config.concurrency));
        let authority: Arc<dyn MetadataAuthority> = Arc::new(RetryingAuthority::new(
            self.authority,
            config.authority.clone(),
        ));

        let scheduler = Arc::new(NodeScheduler::new(
            self.directory,
            scheduler::ranking_policy(config.scheduler.ranking, self.optimizer),
            NodeBlacklist::new(config.scheduler.blacklist_ttl()),
            config.scheduler.clone(),
        ));
        let signing_key = self
            .signing_key
            .unwrap_or_else(|| SigningKey::generate(&mut OsRng));
        let transport = Arc::new(ShardTransport::new(
            self.connector,
            scheduler.clone(),
            Arc::new(signing_key),
            config.transport.clone(),
        ));

        let coordinator = Arc::new(ShardCoordinator::new(
            transport.clone(),
            pools.clone(),
            config.coordinator.clone(),
        ));
        let policy = self
            .redundancy
            .unwrap_or_else(|| Arc::new(config.redundancy.clone()));
        let blocks = Arc::new(BlockUploader::new(
            authority.clone(),
            coordinator,
            policy,
            config.authority.max_commit_attempts,
        ));
        let uploader = ObjectUploader::new(
            authority.clone(),
            blocks,
            pools.clone(),
            config.chunking.block_size,
            config.session.keepalive_window(),
        );

        let fetcher = Arc::new(BlockFetcher::new(authority.clone(), transport, pools.clone()));
        let downloader = ObjectDownloader::new(authority, fetcher);

        Ok(ShardlineClient {
            config,
            pools,
            scheduler,
            uploader,
            downloader,
        })
    }
}
