//! Shardline Core Library
//!
//! Client-side data path primitives for the Shardline object store.
//! This crate provides:
//! - Bounded-size block chunking with content hashes and convergent keys
//! - Deterministic AES-256-GCM block encryption and padding-free key wrap
//! - Redundancy coding: authority-stored, replicated, or Reed-Solomon shards
//! - Common types and error handling

pub mod chunk;
pub mod crypto;
pub mod erasure;
pub mod error;

pub use chunk::{block_count, BlockChunker, PlainBlock};
pub use crypto::{
    content_key, decrypt_block, encrypt_block, unwrap_key, wrap_key, BlockKey, ContentHash,
    EncryptedBlock, WrappedKey,
};
pub use erasure::{
    decode, encode, redundancy_hash, shard_set_hash, ErasureCodec, RedundancyMode,
    RedundancyPolicy, Shard, SizeThresholdPolicy,
};
pub use error::{Result, ShardlineError};

/// Default Reed-Solomon layout for erasure mode.
///
/// Any `DATA_SHARDS` of the `TOTAL_SHARDS` shards reconstruct a block.
pub const DATA_SHARDS: usize = 10;
pub const PARITY_SHARDS: usize = 4;
pub const TOTAL_SHARDS: usize = DATA_SHARDS + PARITY_SHARDS;

/// Default number of replicas in copy mode.
pub const DEFAULT_COPIES: usize = 3;

/// Block size constants
pub const MIN_BLOCK_SIZE: usize = 256;
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024; // 2 MB
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024; // 64 MB
