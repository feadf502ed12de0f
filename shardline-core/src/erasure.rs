//! Redundancy coding
//!
//! Turns an encrypted block into a shard set and back. Three modes:
//! - `Stored`: the ciphertext is kept by the metadata authority (one shard)
//! - `Copy`: every shard is a full replica, any one reconstructs
//! - `Erasure`: systematic Reed-Solomon, any `data` of `data + parity` reconstruct
//!
//! The redundancy hash (`VHB`) binds the shard-hash set to the block so the
//! uploader, the storage nodes and the authority agree on shard identity.

use crate::crypto::ContentHash;
use crate::error::{Result, ShardlineError};
use crate::{DATA_SHARDS, DEFAULT_COPIES, PARITY_SHARDS};
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Redundancy mode of a block (`AR`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RedundancyMode {
    /// Ciphertext stored directly by the metadata authority
    Stored,
    /// Full replicas
    Copy { copies: u8 },
    /// Reed-Solomon data + parity shards
    Erasure { data: u8, parity: u8 },
}

impl RedundancyMode {
    /// Number of shards produced by `encode`
    pub fn total_shards(&self) -> usize {
        match *self {
            Self::Stored => 1,
            Self::Copy { copies } => copies as usize,
            Self::Erasure { data, parity } => data as usize + parity as usize,
        }
    }

    /// Minimum number of valid shards needed by `decode`
    pub fn min_shards(&self) -> usize {
        match *self {
            Self::Stored | Self::Copy { .. } => 1,
            Self::Erasure { data, .. } => data as usize,
        }
    }

    /// Whether shards are placed on storage nodes
    pub fn is_distributed(&self) -> bool {
        !matches!(self, Self::Stored)
    }

    /// Check the mode is usable
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Stored => Ok(()),
            Self::Copy { copies } if copies == 0 => Err(ShardlineError::Configuration(
                "copies must be > 0".to_string(),
            )),
            Self::Copy { .. } => Ok(()),
            Self::Erasure { data, parity } => {
                if data == 0 || parity == 0 {
                    return Err(ShardlineError::Configuration(
                        "data and parity shards must be > 0".to_string(),
                    ));
                }
                if data as usize + parity as usize > 255 {
                    return Err(ShardlineError::Configuration(
                        "at most 255 shards per block".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Stored => 0,
            Self::Copy { .. } => 1,
            Self::Erasure { .. } => 2,
        }
    }
}

impl fmt::Display for RedundancyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stored => write!(f, "stored"),
            Self::Copy { copies } => write!(f, "copy-{}", copies),
            Self::Erasure { data, parity } => write!(f, "erasure-{}+{}", data, parity),
        }
    }
}

/// Chooses a redundancy mode for a block of ciphertext
pub trait RedundancyPolicy: Send + Sync {
    fn choose(&self, ciphertext_len: usize) -> RedundancyMode;
}

/// Size-based policy: tiny blocks are stored, small blocks replicated,
/// the rest erasure coded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeThresholdPolicy {
    /// Ciphertexts up to this size go to the authority (0 disables)
    pub stored_max_bytes: usize,
    /// Ciphertexts up to this size are replicated (0 disables)
    pub copy_max_bytes: usize,
    /// Replica count in copy mode
    pub copies: u8,
    /// Reed-Solomon data shards
    pub data_shards: u8,
    /// Reed-Solomon parity shards
    pub parity_shards: u8,
}

impl Default for SizeThresholdPolicy {
    fn default() -> Self {
        Self {
            stored_max_bytes: 4 * 1024,   // 4 KB
            copy_max_bytes: 64 * 1024,    // 64 KB
            copies: DEFAULT_COPIES as u8,
            data_shards: DATA_SHARDS as u8,
            parity_shards: PARITY_SHARDS as u8,
        }
    }
}

impl SizeThresholdPolicy {
    /// Policy that erasure codes every block
    pub fn erasure_only(data_shards: u8, parity_shards: u8) -> Self {
        Self {
            stored_max_bytes: 0,
            copy_max_bytes: 0,
            copies: DEFAULT_COPIES as u8,
            data_shards,
            parity_shards,
        }
    }

    /// Validate all modes the policy can produce
    pub fn validate(&self) -> Result<()> {
        RedundancyMode::Copy {
            copies: self.copies,
        }
        .validate()?;
        RedundancyMode::Erasure {
            data: self.data_shards,
            parity: self.parity_shards,
        }
        .validate()
    }
}

impl RedundancyPolicy for SizeThresholdPolicy {
    fn choose(&self, ciphertext_len: usize) -> RedundancyMode {
        if ciphertext_len <= self.stored_max_bytes {
            RedundancyMode::Stored
        } else if ciphertext_len <= self.copy_max_bytes {
            RedundancyMode::Copy {
                copies: self.copies,
            }
        } else {
            RedundancyMode::Erasure {
                data: self.data_shards,
                parity: self.parity_shards,
            }
        }
    }
}

/// A single shard of an encoded block
#[derive(Clone, Serialize, Deserialize)]
pub struct Shard {
    /// Shard index (0 to total_shards-1)
    pub index: u8,
    /// Shard payload
    pub data: Bytes,
    /// Hash of the payload (`VHF`)
    pub hash: ContentHash,
}

impl Shard {
    /// Create a shard, hashing its payload
    pub fn new(index: u8, data: Bytes) -> Self {
        let hash = ContentHash::compute(&data);
        Self { index, data, hash }
    }

    /// Payload size
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Verify bytes returned by a storage node against an expected `VHF`.
    ///
    /// Nodes may return padded payloads, so the bytes are truncated to the
    /// fixed payload length before hashing.
    pub fn verify_payload(
        index: u8,
        mut data: Bytes,
        expected: &ContentHash,
        payload_len: usize,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(ShardlineError::VerificationFailed(format!(
                "empty payload for shard {}",
                expected
            )));
        }
        if data.len() < payload_len {
            return Err(ShardlineError::VerificationFailed(format!(
                "short payload for shard {}: {} < {}",
                expected,
                data.len(),
                payload_len
            )));
        }
        data.truncate(payload_len);
        let shard = Self::new(index, data);
        if shard.hash != *expected {
            return Err(ShardlineError::VerificationFailed(format!(
                "hash mismatch for shard {}: got {}",
                expected, shard.hash
            )));
        }
        Ok(shard)
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("index", &self.index)
            .field("size", &self.data.len())
            .field("hash", &self.hash)
            .finish()
    }
}

/// Reed-Solomon encoder/decoder
pub struct ErasureCodec {
    data_shards: usize,
    parity_shards: usize,
    encoder: ReedSolomon,
}

impl ErasureCodec {
    /// Create a codec for the given layout
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        let encoder = ReedSolomon::new(data_shards, parity_shards)?;
        Ok(Self {
            data_shards,
            parity_shards,
            encoder,
        })
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Size of each shard for a payload of `data_size` bytes
    pub fn shard_size(&self, data_size: usize) -> usize {
        data_size.div_ceil(self.data_shards).max(1)
    }

    /// Split and pad data into `data_shards` buffers plus zeroed parity buffers
    fn prepare(&self, data: &[u8], parallel: bool) -> Vec<Vec<u8>> {
        let shard_size = self.shard_size(data.len());
        let mut padded = data.to_vec();
        padded.resize(shard_size * self.data_shards, 0);

        let mut shards: Vec<Vec<u8>> = if parallel {
            padded.par_chunks(shard_size).map(|c| c.to_vec()).collect()
        } else {
            padded.chunks(shard_size).map(|c| c.to_vec()).collect()
        };
        shards.extend((0..self.parity_shards).map(|_| vec![0u8; shard_size]));
        shards
    }

    /// Encode data into data + parity shards
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Shard>> {
        let mut shards = self.prepare(data, false);
        self.encoder.encode(&mut shards)?;

        Ok(shards
            .into_iter()
            .enumerate()
            .map(|(i, buf)| Shard::new(i as u8, Bytes::from(buf)))
            .collect())
    }

    /// Encode using parallel splitting and hashing, for large blocks (> 1MB)
    pub fn encode_parallel(&self, data: &[u8]) -> Result<Vec<Shard>> {
        let mut shards = self.prepare(data, true);
        self.encoder.encode(&mut shards)?;

        Ok(shards
            .into_par_iter()
            .enumerate()
            .map(|(i, buf)| Shard::new(i as u8, Bytes::from(buf)))
            .collect())
    }

    /// Decode from any subset of at least `data_shards` shards
    pub fn decode(&self, shards: &[Shard], original_size: usize) -> Result<Vec<u8>> {
        let total = self.total_shards();
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut available = 0;

        for shard in shards {
            let index = shard.index as usize;
            if index >= total || slots[index].is_some() {
                continue;
            }
            slots[index] = Some(shard.data.to_vec());
            available += 1;
        }

        if available < self.data_shards {
            return Err(ShardlineError::Reconstruction {
                available,
                required: self.data_shards,
            });
        }

        self.encoder.reconstruct_data(&mut slots).map_err(|e| match e {
            reed_solomon_erasure::Error::TooFewShardsPresent => ShardlineError::Reconstruction {
                available,
                required: self.data_shards,
            },
            other => ShardlineError::Codec(other.to_string()),
        })?;

        let mut result = Vec::with_capacity(self.shard_size(original_size) * self.data_shards);
        for slot in slots.iter().take(self.data_shards) {
            match slot {
                Some(buf) => result.extend_from_slice(buf),
                None => return Err(ShardlineError::Internal("Reconstruction failed".to_string())),
            }
        }

        if result.len() < original_size {
            return Err(ShardlineError::Codec(format!(
                "decoded {} bytes, expected {}",
                result.len(),
                original_size
            )));
        }
        result.truncate(original_size);
        Ok(result)
    }

    /// Verify that a complete shard set is consistent
    pub fn verify_shards(&self, shards: &[Shard]) -> Result<bool> {
        if shards.len() != self.total_shards() {
            return Ok(false);
        }

        let expected_size = shards.first().map(|s| s.size()).unwrap_or(0);
        if !shards.iter().all(|s| s.size() == expected_size) {
            return Ok(false);
        }

        let mut ordered: Vec<&Shard> = shards.iter().collect();
        ordered.sort_by_key(|s| s.index);
        let refs: Vec<&[u8]> = ordered.iter().map(|s| s.data.as_ref()).collect();
        Ok(self.encoder.verify(&refs)?)
    }
}

/// Encode ciphertext into a shard set for the given mode
pub fn encode(ciphertext: &[u8], mode: RedundancyMode) -> Result<Vec<Shard>> {
    mode.validate()?;
    match mode {
        RedundancyMode::Stored => Ok(vec![Shard::new(0, Bytes::copy_from_slice(ciphertext))]),
        RedundancyMode::Copy { copies } => {
            let replica = Shard::new(0, Bytes::copy_from_slice(ciphertext));
            Ok((0..copies)
                .map(|i| Shard {
                    index: i,
                    ..replica.clone()
                })
                .collect())
        }
        RedundancyMode::Erasure { data, parity } => {
            let codec = ErasureCodec::new(data as usize, parity as usize)?;
            if ciphertext.len() > 1024 * 1024 {
                codec.encode_parallel(ciphertext)
            } else {
                codec.encode(ciphertext)
            }
        }
    }
}

/// Reconstruct ciphertext from shards.
///
/// Succeeds with any one valid shard (stored/copy) or any `data` distinct
/// shards (erasure); otherwise fails with `Reconstruction`.
pub fn decode(shards: &[Shard], mode: RedundancyMode, ciphertext_size: usize) -> Result<Vec<u8>> {
    mode.validate()?;
    match mode {
        RedundancyMode::Stored | RedundancyMode::Copy { .. } => {
            let replica = shards
                .iter()
                .find(|s| s.size() >= ciphertext_size)
                .ok_or(ShardlineError::Reconstruction {
                    available: 0,
                    required: 1,
                })?;
            Ok(replica.data[..ciphertext_size].to_vec())
        }
        RedundancyMode::Erasure { data, parity } => {
            ErasureCodec::new(data as usize, parity as usize)?.decode(shards, ciphertext_size)
        }
    }
}

/// Compute the redundancy hash (`VHB`) over `(index, VHF)` pairs.
///
/// Pairs are first put in canonical index order, so arrival order never
/// matters. Stored and copy modes hash the hashes in index order; erasure
/// mode hashes the sorted hash set.
pub fn redundancy_hash<I>(mode: RedundancyMode, shard_hashes: I) -> ContentHash
where
    I: IntoIterator<Item = (u8, ContentHash)>,
{
    let mut pairs: Vec<(u8, ContentHash)> = shard_hashes.into_iter().collect();
    pairs.sort_by_key(|(index, _)| *index);

    let mut hashes: Vec<ContentHash> = pairs.into_iter().map(|(_, h)| h).collect();
    if matches!(mode, RedundancyMode::Erasure { .. }) {
        hashes.sort();
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(&[mode.tag()]);
    hasher.update(&(hashes.len() as u32).to_le_bytes());
    for hash in &hashes {
        hasher.update(hash.as_bytes());
    }
    ContentHash::from_bytes(*hasher.finalize().as_bytes())
}

/// Redundancy hash of a shard set
pub fn shard_set_hash(mode: RedundancyMode, shards: &[Shard]) -> ContentHash {
    redundancy_hash(mode, shards.iter().map(|s| (s.index, s.hash)))
}
