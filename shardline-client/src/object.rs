//! Object orchestrator
//!
//! init(VHW, length) -> per-block uploads -> finalize(VHW).
//!
//! Blocks already committed by an interrupted attempt are skipped. The
//! first block failure stops new block starts; blocks already admitted
//! run to completion so their pool slots are released normally.
//!
//! The source stream is a blocking reader. Hashing and chunking run on
//! the blocking pool; chunked blocks reach the async side over a bounded
//! channel.

use crate::authority::MetadataAuthority;
use crate::block::BlockUploader;
use crate::model::SessionId;
use crate::pool::ResourcePools;
use crate::UserCredentials;
use parking_lot::Mutex;
use shardline_core::{BlockChunker, ContentHash, PlainBlock, Result, ShardlineError};
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Blocks chunked ahead of the block pool
const READ_AHEAD_BLOCKS: usize = 2;

/// Summary of a finished object upload
#[derive(Debug, Clone)]
pub struct ObjectReceipt {
    pub session: SessionId,
    pub vhw: ContentHash,
    pub length: u64,
    /// Blocks committed by this attempt
    pub committed: u32,
    /// Of those, blocks linked to existing storage
    pub deduplicated: u32,
    /// Blocks skipped because an earlier attempt committed them
    pub skipped: u32,
    /// The upload continued an interrupted session
    pub resumed: bool,
}

/// Shared state of one running upload
struct UploadSession {
    id: SessionId,
    started: Instant,
    last_progress_ms: AtomicU64,
    committed: AtomicU32,
    deduplicated: AtomicU32,
    failed: AtomicBool,
    error: Mutex<Option<ShardlineError>>,
}

impl UploadSession {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            started: Instant::now(),
            last_progress_ms: AtomicU64::new(0),
            committed: AtomicU32::new(0),
            deduplicated: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Record the terminal error; only the first caller wins
    fn fail(&self, err: ShardlineError) -> bool {
        if self
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.error.lock() = Some(err);
            true
        } else {
            false
        }
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn take_error(&self) -> Option<ShardlineError> {
        self.error.lock().take()
    }

    fn touch(&self) {
        self.last_progress_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_progress_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

pub struct ObjectUploader {
    authority: Arc<dyn MetadataAuthority>,
    blocks: Arc<BlockUploader>,
    pools: ResourcePools,
    block_size: usize,
    keepalive_window: Duration,
}

impl ObjectUploader {
    pub fn new(
        authority: Arc<dyn MetadataAuthority>,
        blocks: Arc<BlockUploader>,
        pools: ResourcePools,
        block_size: usize,
        keepalive_window: Duration,
    ) -> Self {
        Self {
            authority,
            blocks,
            pools,
            block_size,
            keepalive_window,
        }
    }

    /// Upload a seekable byte stream as one object.
    ///
    /// The stream is read twice: once for the object hash and length, then
    /// again block by block.
    #[instrument(skip_all, fields(user = %user.user_id))]
    pub async fn upload<R>(&self, user: Arc<UserCredentials>, reader: R) -> Result<ObjectReceipt>
    where
        R: Read + Seek + Send + 'static,
    {
        let _object_permit = self.pools.acquire_object().await?;

        let (reader, vhw, length) = tokio::task::spawn_blocking(move || hash_object(reader))
            .await
            .map_err(|e| ShardlineError::Internal(format!("object hashing task failed: {}", e)))??;

        let init = self
            .authority
            .init_upload_object(user.user_id, vhw, length)
            .await?;
        let committed: HashSet<u32> = init.committed.iter().copied().collect();
        let session = Arc::new(UploadSession::new(init.session));
        info!(
            session = %session.id,
            vhw = %vhw,
            length,
            resumed = init.resumed,
            already_committed = committed.len(),
            "Object upload started"
        );

        let stop_keepalive = CancellationToken::new();
        let keepalive = tokio::spawn(
            keepalive_loop(
                self.authority.clone(),
                session.clone(),
                self.keepalive_window,
                stop_keepalive.clone(),
            )
            .in_current_span(),
        );

        let mut tasks = JoinSet::new();
        let mut skipped = 0u32;

        let mut blocks = spawn_chunker(reader, self.block_size);
        while let Some(next) = blocks.recv().await {
            if session.is_failed() {
                break;
            }
            let block = match next {
                Ok(block) => block,
                Err(e) => {
                    session.fail(e);
                    break;
                }
            };
            if committed.contains(&block.ordinal) {
                debug!(ordinal = block.ordinal, "Block committed earlier, skipping");
                skipped += 1;
                continue;
            }

            let permit = match self.pools.acquire_block().await {
                Ok(permit) => permit,
                Err(e) => {
                    session.fail(e);
                    break;
                }
            };
            // A block may have failed while we waited for the slot
            if session.is_failed() {
                break;
            }

            let uploader = self.blocks.clone();
            let user = user.clone();
            let session = session.clone();
            tasks.spawn(
                async move {
                    let _permit = permit;
                    match uploader.upload(session.id, &user, block).await {
                        Ok(receipt) => {
                            session.committed.fetch_add(1, Ordering::Relaxed);
                            if receipt.commit.deduplicated {
                                session.deduplicated.fetch_add(1, Ordering::Relaxed);
                            }
                            session.touch();
                        }
                        Err(e) => {
                            if session.fail(e) {
                                warn!(session = %session.id, "Block failed, stopping new block starts");
                            }
                        }
                    }
                }
                .in_current_span(),
            );
        }
        // Stops the chunker if the loop ended early
        drop(blocks);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Block task panicked");
                session.fail(ShardlineError::Internal(format!("block task panicked: {}", e)));
            }
        }

        stop_keepalive.cancel();
        let _ = keepalive.await;

        if let Some(err) = session.take_error() {
            warn!(session = %session.id, error = %err, "Object upload failed");
            return Err(err);
        }

        self.authority.finalize_object(session.id, vhw).await?;

        let receipt = ObjectReceipt {
            session: session.id,
            vhw,
            length,
            committed: session.committed.load(Ordering::Relaxed),
            deduplicated: session.deduplicated.load(Ordering::Relaxed),
            skipped,
            resumed: init.resumed,
        };
        info!(
            session = %receipt.session,
            committed = receipt.committed,
            deduplicated = receipt.deduplicated,
            skipped = receipt.skipped,
            elapsed_ms = session.started.elapsed().as_millis() as u64,
            "Object upload finalized"
        );
        Ok(receipt)
    }
}

/// Hash the whole stream, then rewind it for chunking
fn hash_object<R: Read + Seek>(mut reader: R) -> Result<(R, ContentHash, u64)> {
    let (vhw, length) = ContentHash::compute_reader(&mut reader)?;
    reader.seek(SeekFrom::Start(0))?;
    Ok((reader, vhw, length))
}

/// Chunk `reader` on the blocking pool
fn spawn_chunker<R>(reader: R, block_size: usize) -> mpsc::Receiver<Result<PlainBlock>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(READ_AHEAD_BLOCKS);
    tokio::task::spawn_blocking(move || {
        for next in BlockChunker::new(reader, block_size) {
            if tx.blocking_send(next).is_err() {
                break;
            }
        }
    });
    rx
}

/// Ping the authority whenever no block completed within `window`
async fn keepalive_loop(
    authority: Arc<dyn MetadataAuthority>,
    session: Arc<UploadSession>,
    window: Duration,
    stop: CancellationToken,
) {
    let tick = (window / 2).max(Duration::from_millis(10));
    let mut last_ping = Instant::now();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(tick) => {}
        }
        if session.idle() < window || last_ping.elapsed() < window {
            continue;
        }
        last_ping = Instant::now();
        match authority.keep_alive(session.id).await {
            Ok(()) => debug!(session = %session.id, "Session keep-alive sent"),
            Err(e) => debug!(session = %session.id, error = %e, "Session keep-alive failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let session = UploadSession::new(SessionId::new());
        assert!(session.fail(ShardlineError::Cancelled));
        assert!(!session.fail(ShardlineError::Timeout(5)));
        assert!(session.is_failed());
        assert!(matches!(session.take_error(), Some(ShardlineError::Cancelled)));
    }

    #[test]
    fn test_touch_resets_idle() {
        let session = UploadSession::new(SessionId::new());
        std::thread::sleep(Duration::from_millis(30));
        assert!(session.idle() >= Duration::from_millis(30));
        session.touch();
        assert!(session.idle() < Duration::from_millis(30));
    }
}
