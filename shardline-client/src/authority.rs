//! Metadata authority interface
//!
//! The authority owns sessions, block metadata and per-user references.
//! Every call may fail transiently; [`RetryingAuthority`] wraps any
//! implementation with a fixed retry budget for retryable errors.

use crate::config::AuthorityConfig;
use crate::model::{
    BlockCommit, BlockId, BlockLocation, CommitReceipt, DedupCandidate, ObjectLocator,
    ObjectManifest, SessionId, UploadInit, UserId,
};
use async_trait::async_trait;
use shardline_core::{ContentHash, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Metadata authority RPCs used by the client
#[async_trait]
pub trait MetadataAuthority: Send + Sync {
    /// Open (or resume) an upload session for an object
    async fn init_upload_object(
        &self,
        user: UserId,
        vhw: ContentHash,
        length: u64,
    ) -> Result<UploadInit>;

    /// Blocks already stored with the same plaintext hash
    async fn check_block_dup(
        &self,
        session: SessionId,
        vhp: ContentHash,
    ) -> Result<Vec<DedupCandidate>>;

    /// Publish a block and record the caller's reference to it
    async fn commit_block(&self, commit: BlockCommit) -> Result<CommitReceipt>;

    /// Close a session once every block is committed
    async fn finalize_object(&self, session: SessionId, vhw: ContentHash) -> Result<()>;

    /// Resolve an object to its reference list
    async fn init_download_object(
        &self,
        user: UserId,
        locator: ObjectLocator,
    ) -> Result<ObjectManifest>;

    /// Resolve a block to its ciphertext or shard locations
    async fn init_download_block(&self, vbi: BlockId) -> Result<BlockLocation>;

    /// Keep an idle session from expiring
    async fn keep_alive(&self, session: SessionId) -> Result<()>;
}

/// Authority wrapper that retries transient failures
pub struct RetryingAuthority {
    inner: Arc<dyn MetadataAuthority>,
    config: AuthorityConfig,
}

impl RetryingAuthority {
    pub fn new(inner: Arc<dyn MetadataAuthority>, config: AuthorityConfig) -> Self {
        Self { inner, config }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!(
                        operation,
                        attempt,
                        error = %e,
                        "Authority call failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(e) => {
                    debug!(operation, attempts = attempt + 1, error = %e, "Authority call failed");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl MetadataAuthority for RetryingAuthority {
    async fn init_upload_object(
        &self,
        user: UserId,
        vhw: ContentHash,
        length: u64,
    ) -> Result<UploadInit> {
        self.with_retry("init_upload_object", || {
            self.inner.init_upload_object(user, vhw, length)
        })
        .await
    }

    async fn check_block_dup(
        &self,
        session: SessionId,
        vhp: ContentHash,
    ) -> Result<Vec<DedupCandidate>> {
        self.with_retry("check_block_dup", || self.inner.check_block_dup(session, vhp))
            .await
    }

    async fn commit_block(&self, commit: BlockCommit) -> Result<CommitReceipt> {
        self.with_retry("commit_block", || self.inner.commit_block(commit.clone()))
            .await
    }

    async fn finalize_object(&self, session: SessionId, vhw: ContentHash) -> Result<()> {
        self.with_retry("finalize_object", || self.inner.finalize_object(session, vhw))
            .await
    }

    async fn init_download_object(
        &self,
        user: UserId,
        locator: ObjectLocator,
    ) -> Result<ObjectManifest> {
        self.with_retry("init_download_object", || {
            self.inner.init_download_object(user, locator.clone())
        })
        .await
    }

    async fn init_download_block(&self, vbi: BlockId) -> Result<BlockLocation> {
        self.with_retry("init_download_block", || self.inner.init_download_block(vbi))
            .await
    }

    async fn keep_alive(&self, session: SessionId) -> Result<()> {
        // Missing one ping is harmless; the next window retries
        self.inner.keep_alive(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::ShardlineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Authority whose upload init fails a fixed number of times
    struct Flaky {
        failures: AtomicU32,
        calls: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl MetadataAuthority for Flaky {
        async fn init_upload_object(&self, _: UserId, _: ContentHash, _: u64) -> Result<UploadInit> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.retryable {
                    ShardlineError::communication("authority", "connection reset")
                } else {
                    ShardlineError::Argument("bad length".into())
                });
            }
            Ok(UploadInit {
                session: SessionId::new(),
                committed: Vec::new(),
                resumed: false,
            })
        }

        async fn check_block_dup(&self, _: SessionId, _: ContentHash) -> Result<Vec<DedupCandidate>> {
            unreachable!()
        }

        async fn commit_block(&self, _: BlockCommit) -> Result<CommitReceipt> {
            unreachable!()
        }

        async fn finalize_object(&self, _: SessionId, _: ContentHash) -> Result<()> {
            unreachable!()
        }

        async fn init_download_object(&self, _: UserId, _: ObjectLocator) -> Result<ObjectManifest> {
            unreachable!()
        }

        async fn init_download_block(&self, _: BlockId) -> Result<BlockLocation> {
            unreachable!()
        }

        async fn keep_alive(&self, _: SessionId) -> Result<()> {
            unreachable!()
        }
    }

    fn config(retries: u32) -> AuthorityConfig {
        AuthorityConfig {
            retries,
            retry_delay_ms: 1,
            max_commit_attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let inner = Arc::new(Flaky {
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
            retryable: true,
        });
        let authority = RetryingAuthority::new(inner.clone(), config(3));

        let init = authority
            .init_upload_object(UserId(1), ContentHash::compute(b"x"), 1)
            .await;
        assert!(init.is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let inner = Arc::new(Flaky {
            failures: AtomicU32::new(10),
            calls: AtomicU32::new(0),
            retryable: true,
        });
        let authority = RetryingAuthority::new(inner.clone(), config(2));

        let result = authority
            .init_upload_object(UserId(1), ContentHash::compute(b"x"), 1)
            .await;
        assert!(matches!(result, Err(ShardlineError::Communication { .. })));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let inner = Arc::new(Flaky {
            failures: AtomicU32::new(1),
            calls: AtomicU32::new(0),
            retryable: false,
        });
        let authority = RetryingAuthority::new(inner.clone(), config(5));

        let result = authority
            .init_upload_object(UserId(1), ContentHash::compute(b"x"), 1)
            .await;
        assert!(matches!(result, Err(ShardlineError::Argument(_))));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
