//! Bounded admission pools
//!
//! Each pool is a fixed-capacity semaphore. Permits are owned and released
//! on drop, so a failing or panicking task always frees its slot. Pools
//! are handed to the orchestrators explicitly; two clients only share
//! limits if they share a `ResourcePools`.

use crate::config::ConcurrencyConfig;
use shardline_core::{Result, ShardlineError};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct ResourcePools {
    objects: Arc<Semaphore>,
    blocks: Arc<Semaphore>,
    shard_uploads: Arc<Semaphore>,
    shard_downloads: Arc<Semaphore>,
}

impl ResourcePools {
    pub fn new(config: &ConcurrencyConfig) -> Self {
        Self {
            objects: Arc::new(Semaphore::new(config.max_objects)),
            blocks: Arc::new(Semaphore::new(config.max_blocks)),
            shard_uploads: Arc::new(Semaphore::new(config.max_shard_uploads)),
            shard_downloads: Arc::new(Semaphore::new(config.max_shard_downloads)),
        }
    }

    pub async fn acquire_object(&self) -> Result<OwnedSemaphorePermit> {
        acquire(&self.objects).await
    }

    pub async fn acquire_block(&self) -> Result<OwnedSemaphorePermit> {
        acquire(&self.blocks).await
    }

    pub async fn acquire_shard_upload(&self) -> Result<OwnedSemaphorePermit> {
        acquire(&self.shard_uploads).await
    }

    pub async fn acquire_shard_download(&self) -> Result<OwnedSemaphorePermit> {
        acquire(&self.shard_downloads).await
    }

    /// Free block slots
    pub fn available_blocks(&self) -> usize {
        self.blocks.available_permits()
    }

    /// Free shard upload slots
    pub fn available_shard_uploads(&self) -> usize {
        self.shard_uploads.available_permits()
    }

    /// Free shard download slots
    pub fn available_shard_downloads(&self) -> usize {
        self.shard_downloads.available_permits()
    }

    /// Refuse all further acquisitions
    pub fn close(&self) {
        self.objects.close();
        self.blocks.close();
        self.shard_uploads.close();
        self.shard_downloads.close();
    }
}

async fn acquire(semaphore: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
    semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ShardlineError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools(limit: usize) -> ResourcePools {
        ResourcePools::new(&ConcurrencyConfig {
            max_objects: limit,
            max_blocks: limit,
            max_shard_uploads: limit,
            max_shard_downloads: limit,
        })
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let pools = pools(2);
        let a = pools.acquire_shard_upload().await.unwrap();
        let _b = pools.acquire_shard_upload().await.unwrap();
        assert_eq!(pools.available_shard_uploads(), 0);
        drop(a);
        assert_eq!(pools.available_shard_uploads(), 1);
    }

    #[tokio::test]
    async fn test_permit_released_when_task_panics() {
        let pools = pools(1);
        let permit = pools.acquire_block().await.unwrap();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            panic!("block task failed");
        });
        assert!(handle.await.is_err());
        assert_eq!(pools.available_blocks(), 1);
    }

    #[tokio::test]
    async fn test_pools_are_independent() {
        let pools = pools(1);
        let _upload = pools.acquire_shard_upload().await.unwrap();
        assert_eq!(pools.available_shard_downloads(), 1);
        assert_eq!(pools.available_blocks(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_is_cancelled() {
        let pools = pools(1);
        pools.close();
        assert!(matches!(
            pools.acquire_block().await,
            Err(ShardlineError::Cancelled)
        ));
    }
}
