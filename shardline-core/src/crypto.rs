//! Cryptographic primitives for Shardline
//!
//! Provides:
//! - Blake3 content hashing (`VHP`, `VHF`, `VHB`, `VHW`)
//! - Convergent content keys (`KD`) derived from block plaintext
//! - Deterministic AES-256-GCM block encryption under a per-block key (`KS`)
//! - Padding-free AES-256 key wrap for `KEU` and `KED`
//! - User key derivation using Argon2

use crate::error::{Result, ShardlineError};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    aes::{
        cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt},
        Aes256,
    },
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// AES-256 key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (12 bytes / 96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// AES block size used by the key wrap
const WRAP_BLOCK: usize = 16;

/// Blake3 derive_key context for convergent content keys
const CONTENT_KEY_CONTEXT: &str = "shardline 2024-01 block content key";

/// Blake3 hash wrapper for content addressing
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Compute Blake3 hash of data
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Compute Blake3 hash of data using multiple threads (for large data)
    pub fn compute_parallel(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update_rayon(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Hash a whole stream (`VHW`), returning the hash and byte count
    pub fn compute_reader<R: std::io::Read>(reader: &mut R) -> Result<(Self, u64)> {
        let mut hasher = blake3::Hasher::new();
        let length = std::io::copy(reader, &mut hasher)?;
        Ok((Self(*hasher.finalize().as_bytes()), length))
    }

    /// Wrap raw hash bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let hash = blake3::Hash::from_hex(s)
            .map_err(|e| ShardlineError::Argument(format!("invalid hash: {}", e)))?;
        Ok(Self(*hash.as_bytes()))
    }

    /// Convert to base58 string (for compact log fields)
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Verify that data matches this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A 256-bit symmetric key: per-block `KS`, content-derived `KD`, or user key
#[derive(Clone, PartialEq, Eq)]
pub struct BlockKey([u8; KEY_SIZE]);

impl BlockKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(ShardlineError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(Self(key))
    }

    /// Derive a user key from a password using Argon2
    pub fn derive_from_password(password: &[u8], salt: &[u8]) -> Result<Self> {
        use argon2::password_hash::SaltString;
        use argon2::{Argon2, PasswordHasher};

        // Salt string must be base64-encoded
        let salt_b64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD_NO_PAD, salt);
        let salt_string = SaltString::from_b64(&salt_b64)
            .map_err(|e| ShardlineError::Encryption(e.to_string()))?;

        let password_hash = Argon2::default()
            .hash_password(password, &salt_string)
            .map_err(|e| ShardlineError::Encryption(e.to_string()))?;

        let hash_bytes = password_hash
            .hash
            .ok_or_else(|| ShardlineError::Encryption("No hash output".to_string()))?;

        Self::from_slice(hash_bytes.as_bytes())
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockKey([REDACTED])")
    }
}

impl Drop for BlockKey {
    fn drop(&mut self) {
        // Zeroize key on drop
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// A 32-byte key wrapped under another key (`KEU` or `KED`)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrappedKey([u8; KEY_SIZE]);

impl WrappedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedKey({})", &self.to_hex()[..16])
    }
}

impl Serialize for WrappedKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for WrappedKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != KEY_SIZE {
            return Err(serde::de::Error::custom("Invalid wrapped key length"));
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Derive the convergent content key `KD` from block plaintext.
///
/// Pure function of the bytes and distinct from the content hash, so the
/// authority (which sees `VHP`) cannot unwrap `KED`.
pub fn content_key(plaintext: &[u8]) -> BlockKey {
    BlockKey(blake3::derive_key(CONTENT_KEY_CONTEXT, plaintext))
}

/// Encrypted block container (`nonce || ciphertext+tag` on the wire)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlock {
    /// Synthetic nonce derived from key and plaintext
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with authentication tag appended
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlock {
    /// Total overhead per encryption (nonce + tag)
    pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

    /// Serialized length
    pub fn len(&self) -> usize {
        self.ciphertext.len() + NONCE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    /// Serialize to bytes (nonce prepended to ciphertext)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len());
        result.extend_from_slice(&self.nonce);
        result.extend_from_slice(&self.ciphertext);
        result
    }

    /// Deserialize from bytes (nonce prepended to ciphertext)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::OVERHEAD {
            return Err(ShardlineError::Decryption(
                "Data too short for encrypted content".to_string(),
            ));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[..NONCE_SIZE]);

        Ok(Self {
            nonce,
            ciphertext: data[NONCE_SIZE..].to_vec(),
        })
    }
}

/// Encrypt a block with AES-256-GCM.
///
/// The nonce is a keyed Blake3 hash of the plaintext, so identical
/// `(plaintext, key)` pairs always yield identical ciphertext.
pub fn encrypt_block(plaintext: &[u8], key: &BlockKey) -> Result<EncryptedBlock> {
    let synthetic = blake3::keyed_hash(key.as_bytes(), plaintext);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&synthetic.as_bytes()[..NONCE_SIZE]);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ShardlineError::Encryption(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| ShardlineError::Encryption(e.to_string()))?;

    Ok(EncryptedBlock {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a block with AES-256-GCM
pub fn decrypt_block(encrypted: &EncryptedBlock, key: &BlockKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ShardlineError::Decryption(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(&encrypted.nonce),
            encrypted.ciphertext.as_slice(),
        )
        .map_err(|_| ShardlineError::Decryption("Authentication failed".to_string()))
}

/// Wrap a key under a wrapping key.
///
/// Two AES-256 blocks chained CBC-style with a zero IV: deterministic and
/// padding-free, the output is exactly `KEY_SIZE` bytes.
pub fn wrap_key(key: &BlockKey, wrapping: &BlockKey) -> WrappedKey {
    let cipher = Aes256::new(GenericArray::from_slice(wrapping.as_bytes()));
    let input = key.as_bytes();

    let mut first = GenericArray::clone_from_slice(&input[..WRAP_BLOCK]);
    cipher.encrypt_block(&mut first);

    let mut second = GenericArray::clone_from_slice(&input[WRAP_BLOCK..]);
    for (b, c) in second.iter_mut().zip(first.iter()) {
        *b ^= c;
    }
    cipher.encrypt_block(&mut second);

    let mut out = [0u8; KEY_SIZE];
    out[..WRAP_BLOCK].copy_from_slice(&first);
    out[WRAP_BLOCK..].copy_from_slice(&second);
    WrappedKey(out)
}

/// Unwrap a key previously produced by [`wrap_key`]
pub fn unwrap_key(wrapped: &WrappedKey, wrapping: &BlockKey) -> BlockKey {
    let cipher = Aes256::new(GenericArray::from_slice(wrapping.as_bytes()));
    let input = wrapped.as_bytes();

    let mut first = GenericArray::clone_from_slice(&input[..WRAP_BLOCK]);
    cipher.decrypt_block(&mut first);

    let mut second = GenericArray::clone_from_slice(&input[WRAP_BLOCK..]);
    cipher.decrypt_block(&mut second);
    for (b, c) in second.iter_mut().zip(input[..WRAP_BLOCK].iter()) {
        *b ^= c;
    }

    let mut out = [0u8; KEY_SIZE];
    out[..WRAP_BLOCK].copy_from_slice(&first);
    out[WRAP_BLOCK..].copy_from_slice(&second);
    BlockKey(out)
}
