//! Storage layer for vellum
//!
//! This crate implements the document store the write pipeline runs on:
//! - NativeDocument: data blob + value slots + term list
//! - Shard: working state with copy-on-commit snapshots and revisions
//! - ShardSet: interleaved-id checkout over several shards
//! - ShardRegistry: endpoint -> shard map shared by all handlers
//! - DocumentStore: the trait the engine talks to
//!
//! # Concurrency
//!
//! - Writes to one shard serialize on its RwLock
//! - Optimistic concurrency is enforced in `replace_document_term` under
//!   that lock, so a versioned write either sees the version it expects or
//!   fails with a soft conflict

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod registry;
pub mod shard;
pub mod shard_set;
pub mod traits;

pub use document::{NativeDocument, TermEntry, SLOT_FIRST_FIELD, SLOT_ID, SLOT_VERSION};
pub use registry::ShardRegistry;
pub use shard::{Shard, ShardSnapshot, ShardState};
pub use shard_set::ShardSet;
pub use traits::{DocumentStore, StoreStats};
pub use vellum_core::StoredLocation;
