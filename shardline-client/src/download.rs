//! Download reconstructor
//!
//! Turns a reference list and a byte range into a sequential reader.
//! Only blocks intersecting the range are resolved; each one is rebuilt
//! from the minimum number of verified shards, falling back to further
//! shards as fetches fail.

use crate::authority::MetadataAuthority;
use crate::model::{BlockLocation, ObjectLocator, ObjectManifest, Reference, ShardLocation, UserId};
use crate::pool::ResourcePools;
use crate::transport::ShardTransport;
use bytes::Bytes;
use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use shardline_core::{
    decode, decrypt_block, unwrap_key, BlockKey, EncryptedBlock, RedundancyMode, Result, Shard,
    ShardlineError,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Half-open byte range `[start, end)`; `end: None` reads to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Range from signed bounds where a negative end means "to the end"
    pub fn from_signed(start: i64, end: i64) -> Result<Self> {
        if start < 0 {
            return Err(ShardlineError::Argument(format!(
                "range start {} is negative",
                start
            )));
        }
        Ok(Self {
            start: start as u64,
            end: (end >= 0).then_some(end as u64),
        })
    }

    /// Clamp against an object length
    fn resolve(&self, length: u64) -> Result<(u64, u64)> {
        let end = self.end.unwrap_or(length);
        if self.start > end || end > length {
            return Err(ShardlineError::Argument(format!(
                "range [{}, {}) outside object of {} bytes",
                self.start, end, length
            )));
        }
        Ok((self.start, end))
    }
}

/// Fetches and decrypts single blocks
pub struct BlockFetcher {
    authority: Arc<dyn MetadataAuthority>,
    transport: Arc<ShardTransport>,
    pools: ResourcePools,
}

impl BlockFetcher {
    pub fn new(
        authority: Arc<dyn MetadataAuthority>,
        transport: Arc<ShardTransport>,
        pools: ResourcePools,
    ) -> Self {
        Self {
            authority,
            transport,
            pools,
        }
    }

    /// Plaintext of the block behind `reference`
    #[instrument(skip_all, fields(vbi = %reference.vbi, ordinal = reference.ordinal))]
    pub async fn fetch(&self, reference: &Reference, user_key: &BlockKey) -> Result<Bytes> {
        let started = Instant::now();
        let real_size = reference.real_size as usize;

        let ciphertext = match self.authority.init_download_block(reference.vbi).await? {
            BlockLocation::Stored { data } => data,
            BlockLocation::Sharded {
                mode,
                shard_size,
                shards,
            } => {
                let fetched = self.collect(mode, shard_size, shards).await?;
                Bytes::from(decode(&fetched, mode, real_size)?)
            }
        };
        if ciphertext.len() < real_size {
            return Err(ShardlineError::VerificationFailed(format!(
                "block {} ciphertext is {} bytes, expected {}",
                reference.vbi,
                ciphertext.len(),
                real_size
            )));
        }

        let ks = unwrap_key(&reference.keu, user_key);
        let encrypted = EncryptedBlock::from_bytes(&ciphertext[..real_size])?;
        let plaintext = decrypt_block(&encrypted, &ks)?;
        if plaintext.len() as u64 != reference.original_size {
            return Err(ShardlineError::VerificationFailed(format!(
                "block {} decrypted to {} bytes, expected {}",
                reference.vbi,
                plaintext.len(),
                reference.original_size
            )));
        }

        debug!(
            bytes = plaintext.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Block reconstructed"
        );
        Ok(Bytes::from(plaintext))
    }

    /// Download shards until `mode.min_shards()` verified ones are in hand
    async fn collect(
        &self,
        mode: RedundancyMode,
        shard_size: usize,
        mut locations: Vec<ShardLocation>,
    ) -> Result<Vec<Shard>> {
        let required = mode.min_shards();
        // Systematic data shards first: decoding them is a plain copy
        locations.sort_by_key(|l| l.index);
        locations.dedup_by_key(|l| l.index);
        let mut pending: VecDeque<ShardLocation> = locations.into();

        let mut in_flight = FuturesUnordered::new();
        let mut fetched: Vec<Shard> = Vec::with_capacity(required);
        let mut failures = 0usize;

        loop {
            while fetched.len() + in_flight.len() < required {
                let Some(location) = pending.pop_front() else {
                    break;
                };
                let transport = self.transport.clone();
                let pools = self.pools.clone();
                in_flight.push(async move {
                    let _permit = pools.acquire_shard_download().await?;
                    transport.download(&location, shard_size).await
                });
            }

            if fetched.len() >= required {
                return Ok(fetched);
            }

            match in_flight.next().await {
                Some(Ok(shard)) => fetched.push(shard),
                Some(Err(e)) => {
                    failures += 1;
                    debug!(error = %e, remaining = pending.len(), "Shard fetch failed, falling back");
                }
                None => {
                    warn!(
                        available = fetched.len(),
                        required,
                        failures,
                        "Not enough shards to reconstruct block"
                    );
                    return Err(ShardlineError::Reconstruction {
                        available: fetched.len(),
                        required,
                    });
                }
            }
        }
    }
}

/// Opens objects for reading
pub struct ObjectDownloader {
    authority: Arc<dyn MetadataAuthority>,
    fetcher: Arc<BlockFetcher>,
}

impl ObjectDownloader {
    pub fn new(authority: Arc<dyn MetadataAuthority>, fetcher: Arc<BlockFetcher>) -> Self {
        Self { authority, fetcher }
    }

    #[instrument(skip_all, fields(user = %user, locator = %locator))]
    pub async fn open(
        &self,
        user: UserId,
        user_key: &BlockKey,
        locator: ObjectLocator,
        range: ByteRange,
    ) -> Result<ObjectReader> {
        let manifest = self.authority.init_download_object(user, locator).await?;
        ObjectReader::new(self.fetcher.clone(), user_key.clone(), manifest, range)
    }
}

/// Check that references tile the object exactly, in ordinal order
fn ordered_references(manifest: &ObjectManifest) -> Result<Vec<Reference>> {
    let mut references = manifest.references.clone();
    references.sort_by_key(|r| r.ordinal);

    let gapless = references
        .iter()
        .enumerate()
        .all(|(i, r)| r.ordinal as usize == i);
    let covered: u64 = references.iter().map(|r| r.original_size).sum();
    if !gapless || covered != manifest.length {
        return Err(ShardlineError::Internal(format!(
            "references cover {} of {} bytes across {} blocks",
            covered,
            manifest.length,
            references.len()
        )));
    }
    Ok(references)
}

/// Sequential reader over a byte range of an object
pub struct ObjectReader {
    fetcher: Arc<BlockFetcher>,
    user_key: BlockKey,
    references: VecDeque<Reference>,
    /// Bytes to discard from the next fetched block
    skip: u64,
    remaining: u64,
    current: Bytes,
}

impl ObjectReader {
    fn new(
        fetcher: Arc<BlockFetcher>,
        user_key: BlockKey,
        manifest: ObjectManifest,
        range: ByteRange,
    ) -> Result<Self> {
        let references = ordered_references(&manifest)?;
        let (start, end) = range.resolve(manifest.length)?;

        // Walk to the block containing `start`
        let mut offset = 0u64;
        let mut needed = VecDeque::new();
        let mut skip = 0u64;
        for reference in references {
            let block_end = offset + reference.original_size;
            if block_end > start && offset < end {
                if needed.is_empty() {
                    skip = start - offset;
                }
                needed.push_back(reference);
            }
            offset = block_end;
        }

        info!(
            vhw = %manifest.vhw,
            start,
            end,
            blocks = needed.len(),
            "Object opened for reading"
        );
        Ok(Self {
            fetcher,
            user_key,
            references: needed,
            skip,
            remaining: end - start,
            current: Bytes::new(),
        })
    }

    /// Bytes left in the range
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Make sure `current` holds unread bytes; `false` at the end
    async fn fill(&mut self) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        while self.current.is_empty() {
            let reference = self.references.pop_front().ok_or_else(|| {
                ShardlineError::Internal(format!(
                    "references ran out with {} bytes left",
                    self.remaining
                ))
            })?;
            let block = self.fetcher.fetch(&reference, &self.user_key).await?;
            let skip = (self.skip as usize).min(block.len());
            self.skip = 0;
            self.current = block.slice(skip..);
        }
        Ok(true)
    }

    fn consume(&mut self, max: usize) -> Bytes {
        let take = max
            .min(self.current.len())
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        self.remaining -= take as u64;
        self.current.split_to(take)
    }

    /// Next contiguous piece of the range, `None` at the end
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.fill().await? {
            return Ok(None);
        }
        Ok(Some(self.consume(usize::MAX)))
    }

    /// Fill `buf` with the next bytes; `Ok(0)` at the end
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || !self.fill().await? {
            return Ok(0);
        }
        let chunk = self.consume(buf.len());
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.remaining as usize);
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Chunks of the range as a stream
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> {
        stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_chunk().await?.map(|chunk| (chunk, reader)))
        })
    }
}
