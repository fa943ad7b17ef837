//! Error types for the vellum document pipeline
//!
//! This module defines the single error taxonomy surfaced by every layer.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Retry classification
//!
//! | Variant | Retried? | Where |
//! |---------|----------|-------|
//! | `Client` | never | surfaced verbatim |
//! | `VersionConflict { kind: Soft }` | up to the conflict budget | write path |
//! | `VersionConflict { kind: Hard }` | never | write path |
//! | `ConcurrentModification` | up to the read budget | read path |
//! | `DocumentNotFound` / `ShardNotFound` | n/a | empty state in read-modify-write |
//! | everything else | never | surfaced as a generic failure |

use std::io;
use thiserror::Error;

/// Result type alias for vellum operations
pub type VellumResult<T> = std::result::Result<T, VellumError>;

/// Whether a version conflict may be resolved by re-reading and retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another writer committed between our read and our write
    Soft,
    /// The caller supplied an explicit version that does not match
    Hard,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::Soft => write!(f, "soft"),
            ConflictKind::Hard => write!(f, "hard"),
        }
    }
}

/// Error types for the vellum database front end
#[derive(Debug, Error)]
pub enum VellumError {
    /// Malformed request: bad object, oversize inline payload, missing id,
    /// invalid operation type, write on a read-only handle
    #[error("Client error: {message}")]
    Client {
        /// Human readable reason
        message: String,
    },

    /// Optimistic concurrency failure on a document
    #[error("Version conflict ({kind}) on {term_id}: {message}")]
    VersionConflict {
        /// Soft (retryable) or hard (explicit version mismatch)
        kind: ConflictKind,
        /// Unique term of the document
        term_id: String,
        /// Details
        message: String,
    },

    /// The shard was reopened or modified while a read was in flight
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Document lookup by id or term failed
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Shard endpoint does not exist
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    /// Storage engine failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invariant violated inside the engine
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VellumError {
    /// Create a client error
    pub fn client(message: impl Into<String>) -> Self {
        VellumError::Client {
            message: message.into(),
        }
    }

    /// Create a retryable version conflict
    pub fn soft_conflict(term_id: impl Into<String>, message: impl Into<String>) -> Self {
        VellumError::VersionConflict {
            kind: ConflictKind::Soft,
            term_id: term_id.into(),
            message: message.into(),
        }
    }

    /// Create a non-retryable version conflict
    pub fn hard_conflict(term_id: impl Into<String>, message: impl Into<String>) -> Self {
        VellumError::VersionConflict {
            kind: ConflictKind::Hard,
            term_id: term_id.into(),
            message: message.into(),
        }
    }

    /// Create a storage engine error
    pub fn storage(message: impl Into<String>) -> Self {
        VellumError::Storage(message.into())
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        VellumError::Serialization(message.into())
    }

    /// Create a corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        VellumError::Corruption(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        VellumError::Internal(message.into())
    }

    /// Any version conflict, soft or hard
    pub fn is_conflict(&self) -> bool {
        matches!(self, VellumError::VersionConflict { .. })
    }

    /// A version conflict the write loop may retry
    pub fn is_soft_conflict(&self) -> bool {
        matches!(
            self,
            VellumError::VersionConflict {
                kind: ConflictKind::Soft,
                ..
            }
        )
    }

    /// Missing document or missing shard
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VellumError::DocumentNotFound(_) | VellumError::ShardNotFound(_)
        )
    }

    /// Shard changed underneath a reader
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, VellumError::ConcurrentModification(_))
    }

    /// Client-caused failure
    pub fn is_client(&self) -> bool {
        matches!(self, VellumError::Client { .. })
    }

    /// Re-classify a soft conflict as hard (used once the retry budget is spent)
    pub fn into_hard(self) -> Self {
        match self {
            VellumError::VersionConflict {
                term_id, message, ..
            } => VellumError::VersionConflict {
                kind: ConflictKind::Hard,
                term_id,
                message,
            },
            other => other,
        }
    }

    /// HTTP-like status code carried by per-item bulk error payloads
    pub fn status_code(&self) -> u16 {
        match self {
            VellumError::Client { .. } => 400,
            VellumError::VersionConflict { .. } => 409,
            VellumError::ConcurrentModification(_) => 409,
            VellumError::DocumentNotFound(_) | VellumError::ShardNotFound(_) => 404,
            VellumError::Storage(_)
            | VellumError::Serialization(_)
            | VellumError::Corruption(_)
            | VellumError::Io(_)
            | VellumError::Internal(_) => 500,
        }
    }
}

impl From<rmp_serde::encode::Error> for VellumError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        VellumError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for VellumError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        VellumError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for VellumError {
    fn from(e: serde_json::Error) -> Self {
        VellumError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_client() {
        let err = VellumError::client("Document must have an 'id'");
        let msg = err.to_string();
        assert!(msg.contains("Client error"));
        assert!(msg.contains("'id'"));
    }

    #[test]
    fn test_error_display_conflict() {
        let err = VellumError::soft_conflict("QKdoc", "Version mismatch!");
        let msg = err.to_string();
        assert!(msg.contains("soft"));
        assert!(msg.contains("QKdoc"));
    }

    #[test]
    fn test_conflict_predicates() {
        let soft = VellumError::soft_conflict("t", "m");
        assert!(soft.is_conflict());
        assert!(soft.is_soft_conflict());

        let hard = soft.into_hard();
        assert!(hard.is_conflict());
        assert!(!hard.is_soft_conflict());
    }

    #[test]
    fn test_into_hard_leaves_other_variants() {
        let err = VellumError::storage("disk").into_hard();
        assert!(matches!(err, VellumError::Storage(_)));
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(VellumError::DocumentNotFound("x".into()).is_not_found());
        assert!(VellumError::ShardNotFound("y".into()).is_not_found());
        assert!(!VellumError::storage("z").is_not_found());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(VellumError::client("bad").status_code(), 400);
        assert_eq!(VellumError::hard_conflict("t", "m").status_code(), 409);
        assert_eq!(VellumError::DocumentNotFound("d".into()).status_code(), 404);
        assert_eq!(VellumError::internal("boom").status_code(), 500);
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err: VellumError = io_err.into();
        assert!(matches!(err, VellumError::Io(_)));
    }

    #[test]
    fn test_error_from_rmp_decode() {
        let result: VellumResult<String> =
            rmp_serde::from_slice(&[0xc1]).map_err(VellumError::from);
        assert!(matches!(result, Err(VellumError::Serialization(_))));
    }
}
