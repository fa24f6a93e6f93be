//! Error types shared across the kernel.
//!
//! Consensus failures are *not* errors: they are reported through
//! [`BlockValidationState`](crate::validation::BlockValidationState). The types
//! here describe structural, storage and system failures.
use bitcoin::BlockHash;
use thiserror::Error;

use crate::index::BlockStatus;

/// Result alias used by the engine-facing API.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors raised by the in-memory block tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// The header's parent is not indexed yet (header-first ordering violated).
    #[error("missing parent {prev} for header {hash}")]
    MissingParent {
        /// Hash of the header that was rejected.
        hash: BlockHash,
        /// The unknown parent hash.
        prev: BlockHash,
    },

    /// A null-parent header was offered to an index that already has a genesis.
    #[error("genesis already indexed, refusing second root {hash}")]
    DuplicateGenesis {
        /// Hash of the refused header.
        hash: BlockHash,
    },

    /// The status change would move an entry backwards.
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidStatusTransition {
        /// Current status.
        from: BlockStatus,
        /// Requested status.
        to: BlockStatus,
    },

    /// A persisted record could not be turned back into an entry.
    #[error("corrupt block index record: {0}")]
    CorruptRecord(String),
}

/// Errors raised by the flat-file block store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("block store I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The requested data was never stored.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored bytes failed framing, checksum or decoding.
    #[error("corrupt data: {0}")]
    CorruptData(String),
}

/// Top-level error for [`ChainstateManager`](crate::ChainstateManager) calls.
///
/// A returned error means the call could not complete; it never encodes
/// block validity.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Block tree invariant violated.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Block or undo storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The key-value collaborator failed.
    #[error("database error: {0:#}")]
    Database(anyhow::Error),

    /// Malformed serialized input.
    #[error("decode error: {0}")]
    Decode(#[from] bitcoin::consensus::encode::Error),

    /// The context's interrupt flag was raised.
    #[error("operation cancelled by interrupt")]
    Cancelled,

    /// Unrecoverable condition; the manager must not be used any further.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Options were rejected at construction time.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        KernelError::Database(err)
    }
}

impl KernelError {
    /// Whether this error came from the storage layer (files or database).
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            KernelError::Store(StoreError::Io(_)) | KernelError::Database(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn missing_parent_display_names_both_hashes() {
        let hash = BlockHash::from_byte_array([1u8; 32]);
        let prev = BlockHash::from_byte_array([2u8; 32]);
        let msg = IndexError::MissingParent { hash, prev }.to_string();
        assert!(msg.contains(&hash.to_string()));
        assert!(msg.contains(&prev.to_string()));
    }

    #[test]
    fn database_errors_count_as_io() {
        let err: KernelError = anyhow::anyhow!("disk gone").into();
        assert!(err.is_io());
        assert!(!KernelError::Cancelled.is_io());
    }
}
