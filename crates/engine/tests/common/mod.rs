//! Shared helpers for the engine integration suites.
//!
//! Import via `mod common;`.

#![allow(dead_code)]

use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vellum_core::{
    Endpoints, InternalId, Method, OpenFlags, StoredLocation, TermId, VellumError, VellumResult,
};
use vellum_engine::{DatabaseHandler, Engine, VellumConfig};
use vellum_storage::{DocumentStore, NativeDocument, ShardSet, StoreStats};

/// Engine with a small, fast-cycling pipeline config
pub fn test_engine() -> Arc<Engine> {
    Engine::new(VellumConfig {
        preparer_threads: Some(4),
        bulk_batch_size: 8,
        throttle_limit: 4,
        throttle_signal: 2,
        dequeue_timeout_ms: 10,
        restore_thread_multiplier: 1,
        ..VellumConfig::default()
    })
    .unwrap()
}

/// Writable handler over `endpoints` ("a;b;c" for three shards)
pub fn writable(engine: &Arc<Engine>, endpoints: &str) -> DatabaseHandler {
    engine
        .handler(&endpoints.parse::<Endpoints>().unwrap(), OpenFlags::WRITABLE, Method::Put)
        .unwrap()
}

/// Read-only handler over existing shards
pub fn read_only(engine: &Arc<Engine>, endpoints: &str) -> DatabaseHandler {
    engine
        .handler(&endpoints.parse::<Endpoints>().unwrap(), OpenFlags::READ_ONLY, Method::Get)
        .unwrap()
}

/// Stored object of `id`, without the `_version` the write path adds
pub fn stored_obj(handler: &DatabaseHandler, id: &str) -> Value {
    handler.get_document(id).unwrap().get_obj().unwrap()
}

// ============================================================================
// FlakyStore - fault-injecting DocumentStore
// ============================================================================

/// Store that fails a configurable number of reads and writes
///
/// - `read_failures`: next `get_document` calls fail with a concurrent
///   modification
/// - `write_conflicts`: next `replace_document_term` calls fail with a soft
///   version conflict
pub struct FlakyStore {
    inner: ShardSet,
    pub read_failures: AtomicUsize,
    pub write_conflicts: AtomicUsize,
    pub write_attempts: AtomicUsize,
    pub reopens: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: ShardSet) -> Arc<Self> {
        Arc::new(FlakyStore {
            inner,
            read_failures: AtomicUsize::new(0),
            write_conflicts: AtomicUsize::new(0),
            write_attempts: AtomicUsize::new(0),
            reopens: AtomicUsize::new(0),
        })
    }

    /// Flaky store over a fresh writable shard set owned by `engine`
    pub fn open(engine: &Arc<Engine>, endpoints: &str) -> Arc<Self> {
        let shards = engine
            .shards()
            .open(&endpoints.parse::<Endpoints>().unwrap(), OpenFlags::WRITABLE)
            .unwrap();
        Self::new(shards)
    }

    /// Handler writing through this store
    pub fn handler(self: &Arc<Self>, engine: &Arc<Engine>) -> DatabaseHandler {
        engine.handler_for(Arc::clone(self) as Arc<dyn DocumentStore>, Method::Put)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DocumentStore for FlakyStore {
    fn endpoints(&self) -> &Endpoints {
        self.inner.endpoints()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn find_document(&self, term: &TermId) -> VellumResult<InternalId> {
        self.inner.find_document(term)
    }

    fn get_document(&self, did: InternalId, assume_valid: bool) -> VellumResult<Arc<NativeDocument>> {
        if Self::take(&self.read_failures) {
            return Err(VellumError::ConcurrentModification(format!(
                "injected failure reading ::{}",
                did
            )));
        }
        self.inner.get_document(did, assume_valid)
    }

    fn replace_document(
        &self,
        did: InternalId,
        doc: NativeDocument,
        commit: bool,
    ) -> VellumResult<InternalId> {
        self.inner.replace_document(did, doc, commit)
    }

    fn replace_document_term(
        &self,
        term: &TermId,
        doc: NativeDocument,
        commit: bool,
    ) -> VellumResult<InternalId> {
        self.write_attempts.fetch_add(1, Ordering::AcqRel);
        if Self::take(&self.write_conflicts) {
            return Err(VellumError::soft_conflict(term.as_str(), "injected conflict"));
        }
        self.inner.replace_document_term(term, doc, commit)
    }

    fn delete_document(&self, did: InternalId, commit: bool) -> VellumResult<()> {
        self.inner.delete_document(did, commit)
    }

    fn delete_document_term(&self, term: &TermId, commit: bool) -> VellumResult<()> {
        self.inner.delete_document_term(term, commit)
    }

    fn get_metadata(&self, key: &str) -> VellumResult<Vec<u8>> {
        self.inner.get_metadata(key)
    }

    fn set_metadata(&self, key: &str, value: &[u8], commit: bool) -> VellumResult<()> {
        self.inner.set_metadata(key, value, commit)
    }

    fn metadata_keys(&self) -> VellumResult<Vec<String>> {
        self.inner.metadata_keys()
    }

    fn store_blob(&self, term: &TermId, blob: &[u8]) -> VellumResult<StoredLocation> {
        self.inner.store_blob(term, blob)
    }

    fn get_stored(&self, did: InternalId, location: StoredLocation) -> VellumResult<Vec<u8>> {
        self.inner.get_stored(did, location)
    }

    fn reopen(&self) -> VellumResult<bool> {
        self.reopens.fetch_add(1, Ordering::AcqRel);
        self.inner.reopen()
    }

    fn commit(&self, flush_wal: bool) -> VellumResult<bool> {
        self.inner.commit(flush_wal)
    }

    fn export_documents(&self) -> VellumResult<Vec<(InternalId, Arc<NativeDocument>)>> {
        self.inner.export_documents()
    }

    fn stats(&self) -> VellumResult<StoreStats> {
        self.inner.stats()
    }
}
