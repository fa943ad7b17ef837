//! Core types for vellum
//!
//! This crate defines the foundational types used throughout the system:
//! - InternalId, TermId, VersionToken: document identity and versioning
//! - Endpoint / Endpoints: shard addressing
//! - OpenFlags / Method: handler access mode and request verb
//! - VellumError: error taxonomy with retry classification
//! - Limits: inline payload size and retry budgets
//! - Patch: structured patch application for `patch` writes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod patch;
pub mod types;

pub use error::{ConflictKind, VellumError, VellumResult};
pub use limits::{validate_inline_size, CONFLICT_RETRIES, DB_RETRIES, NON_STORED_SIZE_LIMIT};
pub use patch::{apply_patch, merge_patch, shallow_merge};
pub use types::{
    fields, Endpoint, Endpoints, InternalId, Method, OpenFlags, StoredLocation, TermId,
    VersionToken,
};
