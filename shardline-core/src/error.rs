//! Error types for Shardline
//!
//! Provides a unified error type for the block and shard storage pipeline.
//! Only block- and object-level terminal failures reach callers; shard-level
//! failures are absorbed by node retry and the backup wave.

use thiserror::Error;

/// Result type alias for Shardline operations
pub type Result<T> = std::result::Result<T, ShardlineError>;

/// Unified error type for Shardline
#[derive(Error, Debug)]
pub enum ShardlineError {
    // ===== Request Errors =====
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Codec & Crypto Errors =====
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Reconstruction failed: have {available} usable shards, need {required}")]
    Reconstruction { available: usize, required: usize },

    // ===== Transport Errors =====
    #[error("Communication error with {peer}: {message}")]
    Communication { peer: String, message: String },

    #[error("Admission denied by node {node}")]
    AdmissionDenied { node: String },

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("No eligible storage node after waiting {waited_ms} ms")]
    NoEligibleNode { waited_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    // ===== Placement & Commit Errors =====
    #[error("Insufficient redundancy: placed {placed} shards, need {required}")]
    InsufficientRedundancy { placed: usize, required: usize },

    #[error("Authority rejected placement on blacklisted nodes: {nodes:?}")]
    NodesBlacklisted { nodes: Vec<String> },

    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShardlineError {
    /// Build a communication error for a peer
    pub fn communication(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is transient and may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Communication { .. } | Self::AdmissionDenied { .. } | Self::Timeout(_)
        )
    }
}

impl From<reed_solomon_erasure::Error> for ShardlineError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        ShardlineError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShardlineError::InsufficientRedundancy {
            placed: 2,
            required: 3,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient redundancy: placed 2 shards, need 3"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ShardlineError = io_err.into();
        assert!(matches!(err, ShardlineError::Io(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ShardlineError::communication("node-1", "reset").is_retryable());
        assert!(ShardlineError::AdmissionDenied { node: "n".into() }.is_retryable());
        assert!(!ShardlineError::Argument("bad".into()).is_retryable());
        assert!(!ShardlineError::VerificationFailed("hash".into()).is_retryable());
        assert!(!ShardlineError::SessionExpired("s".into()).is_retryable());
    }
}
