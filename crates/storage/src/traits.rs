//! Document Store Handle contract
//!
//! This module defines the `DocumentStore` trait the write pipeline talks to.
//! It enables swapping the in-memory `ShardSet` for another backend (or a
//! fault-injecting test double) without touching the engine.
//!
//! Failure modes are reported through `VellumError`:
//! - `DocumentNotFound` / `ShardNotFound` for missing documents or shards
//! - `ConcurrentModification` when a reader's view was recycled underneath it
//! - `VersionConflict { kind: Soft }` when a versioned write lost a race
//! - `Storage` for anything else

use std::sync::Arc;

use vellum_core::{Endpoints, InternalId, StoredLocation, TermId, VellumResult};

use crate::document::NativeDocument;

/// Aggregate statistics for a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    /// Live documents
    pub doc_count: u64,
    /// Highest internal id ever assigned
    pub last_docid: u64,
    /// Sum of shard commit revisions
    pub revision: u64,
}

/// Locked access to one shard set
///
/// Thread safety: all methods must be safe to call concurrently from
/// multiple threads (requires Send + Sync). Each call takes the shard lock it
/// needs for the shortest possible region.
pub trait DocumentStore: Send + Sync {
    /// Shards this store addresses, in shard order
    fn endpoints(&self) -> &Endpoints;

    /// True if writes are allowed
    fn is_writable(&self) -> bool;

    /// Look up the document indexed by the unique `term`
    ///
    /// # Errors
    ///
    /// `DocumentNotFound` if no document carries the term.
    fn find_document(&self, term: &TermId) -> VellumResult<InternalId>;

    /// Fetch a document by internal id
    ///
    /// With `assume_valid` the read uses the view the store already holds;
    /// otherwise read-only stores move to the latest committed revision first.
    ///
    /// # Errors
    ///
    /// `DocumentNotFound`, or `ConcurrentModification` if the held view is
    /// no longer readable.
    fn get_document(&self, did: InternalId, assume_valid: bool) -> VellumResult<Arc<NativeDocument>>;

    /// Replace (or create) the document with internal id `did`
    fn replace_document(
        &self,
        did: InternalId,
        doc: NativeDocument,
        commit: bool,
    ) -> VellumResult<InternalId>;

    /// Replace (or create) the document uniquely indexed by `term`
    ///
    /// Enforces optimistic concurrency: if `doc` carries a version and the
    /// stored document's version differs (or the document is gone), the
    /// write fails with a soft `VersionConflict`. On success the stored
    /// version is advanced.
    fn replace_document_term(
        &self,
        term: &TermId,
        doc: NativeDocument,
        commit: bool,
    ) -> VellumResult<InternalId>;

    /// Delete by internal id
    fn delete_document(&self, did: InternalId, commit: bool) -> VellumResult<()>;

    /// Delete the document uniquely indexed by `term`
    fn delete_document_term(&self, term: &TermId, commit: bool) -> VellumResult<()>;

    /// Metadata value for `key`; empty when unset
    fn get_metadata(&self, key: &str) -> VellumResult<Vec<u8>>;

    /// Set metadata `key`; an empty value removes it
    fn set_metadata(&self, key: &str, value: &[u8], commit: bool) -> VellumResult<()>;

    /// All metadata keys in lexical order
    fn metadata_keys(&self) -> VellumResult<Vec<String>>;

    /// Append a `stored` blob to the volume of the shard owning `term`
    fn store_blob(&self, term: &TermId, blob: &[u8]) -> VellumResult<StoredLocation>;

    /// Read back a `stored` blob belonging to document `did`
    fn get_stored(&self, did: InternalId, location: StoredLocation) -> VellumResult<Vec<u8>>;

    /// Move to the latest committed revision; true if anything changed
    fn reopen(&self) -> VellumResult<bool>;

    /// Commit pending changes; true if there was anything to commit
    fn commit(&self, flush_wal: bool) -> VellumResult<bool>;

    /// Every live document, ordered by internal id
    fn export_documents(&self) -> VellumResult<Vec<(InternalId, Arc<NativeDocument>)>>;

    /// Document counts and revision
    fn stats(&self) -> VellumResult<StoreStats>;
}
