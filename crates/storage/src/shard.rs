//! Single shard: working state plus the last committed snapshot
//!
//! # Design
//!
//! - Writers mutate the working `ShardState` under a parking_lot RwLock
//! - `commit()` publishes a copy of the working state as an immutable
//!   `ShardSnapshot` and bumps the shard revision
//! - Readers pin a snapshot. A pinned snapshot stays readable until the shard
//!   has committed twice more; after that, reads fail with
//!   `ConcurrentModification` and the reader has to reopen
//! - `stored` blobs go to an append-only volume shared by all revisions
//!
//! Ids inside a shard are local (1-based, never reused). Mapping them to the
//! interleaved ids of a shard set is the caller's job.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use vellum_core::{Endpoint, VellumError, VellumResult, VersionToken};

use crate::document::NativeDocument;

// ============================================================================
// ShardState
// ============================================================================

/// Documents, term postings and metadata of one shard
#[derive(Debug, Clone, Default)]
pub struct ShardState {
    documents: FxHashMap<u64, Arc<NativeDocument>>,
    postings: FxHashMap<String, BTreeSet<u64>>,
    metadata: BTreeMap<String, Vec<u8>>,
    last_local_id: u64,
}

impl ShardState {
    /// First document indexing `term`
    pub fn find(&self, term: &str) -> Option<u64> {
        self.postings
            .get(term)
            .and_then(|ids| ids.iter().next().copied())
    }

    /// Document with local id `local`
    pub fn get(&self, local: u64) -> Option<Arc<NativeDocument>> {
        self.documents.get(&local).cloned()
    }

    /// Metadata value, empty when unset
    pub fn metadata(&self, key: &str) -> Vec<u8> {
        self.metadata.get(key).cloned().unwrap_or_default()
    }

    /// Metadata keys in lexical order
    pub fn metadata_keys(&self) -> Vec<String> {
        self.metadata.keys().cloned().collect()
    }

    /// Live documents
    pub fn doc_count(&self) -> u64 {
        self.documents.len() as u64
    }

    /// Highest local id ever assigned
    pub fn last_local_id(&self) -> u64 {
        self.last_local_id
    }

    /// Every live document, unordered
    pub fn documents(&self) -> impl Iterator<Item = (u64, &Arc<NativeDocument>)> {
        self.documents.iter().map(|(id, doc)| (*id, doc))
    }

    fn insert(&mut self, local: u64, doc: NativeDocument) {
        self.remove(local);
        for (term, _) in doc.terms() {
            self.postings.entry(term.to_string()).or_default().insert(local);
        }
        self.documents.insert(local, Arc::new(doc));
        self.last_local_id = self.last_local_id.max(local);
    }

    fn remove(&mut self, local: u64) -> bool {
        let Some(old) = self.documents.remove(&local) else {
            return false;
        };
        for (term, _) in old.terms() {
            if let Some(ids) = self.postings.get_mut(term) {
                ids.remove(&local);
                if ids.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        true
    }
}

/// Immutable committed view of a shard
#[derive(Debug, Default)]
pub struct ShardSnapshot {
    revision: u64,
    state: ShardState,
}

impl ShardSnapshot {
    /// Revision this snapshot was committed as
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Committed state
    pub fn state(&self) -> &ShardState {
        &self.state
    }
}

// ============================================================================
// Shard
// ============================================================================

/// One shard of the document store
#[derive(Debug)]
pub struct Shard {
    endpoint: Endpoint,
    working: RwLock<ShardState>,
    dirty: AtomicBool,
    committed: RwLock<Arc<ShardSnapshot>>,
    revision: AtomicU64,
    volume: RwLock<Vec<u8>>,
}

impl Shard {
    /// Create an empty shard at revision 0
    pub fn new(endpoint: Endpoint) -> Self {
        Shard {
            endpoint,
            working: RwLock::new(ShardState::default()),
            dirty: AtomicBool::new(false),
            committed: RwLock::new(Arc::new(ShardSnapshot::default())),
            revision: AtomicU64::new(0),
            volume: RwLock::new(Vec::new()),
        }
    }

    /// Address of this shard
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Latest committed revision
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// True if there are uncommitted changes
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Latest committed snapshot
    pub fn snapshot(&self) -> Arc<ShardSnapshot> {
        Arc::clone(&self.committed.read())
    }

    /// Run `f` against the working state
    pub fn with_working<R>(&self, f: impl FnOnce(&ShardState) -> R) -> R {
        f(&self.working.read())
    }

    /// Store `doc` under local id `local`, enforcing its version
    pub fn replace_document(
        &self,
        local: u64,
        mut doc: NativeDocument,
        label: &str,
    ) -> VellumResult<()> {
        let mut state = self.working.write();
        let current = state.documents.get(&local).cloned();
        resolve_version(label, current.as_deref(), &mut doc)?;
        state.insert(local, doc);
        self.dirty.store(true, Ordering::Release);
        trace!(target: "vellum::storage", shard = %self.endpoint, local, "replace_document");
        Ok(())
    }

    /// Store `doc` as the document uniquely indexed by `term`
    ///
    /// Allocates a fresh local id when no document carries the term.
    /// Returns the local id.
    pub fn replace_document_term(&self, term: &str, mut doc: NativeDocument) -> VellumResult<u64> {
        if !doc.has_term(term) {
            doc.add_boolean_term(term);
        }
        let mut state = self.working.write();
        let existing = state.find(term);
        let current = existing.and_then(|local| state.documents.get(&local).cloned());
        resolve_version(term, current.as_deref(), &mut doc)?;
        let local = existing.unwrap_or(state.last_local_id + 1);
        state.insert(local, doc);
        self.dirty.store(true, Ordering::Release);
        trace!(target: "vellum::storage", shard = %self.endpoint, term, local, "replace_document_term");
        Ok(local)
    }

    /// Remove local id `local`; false if it did not exist
    pub fn delete_document(&self, local: u64) -> bool {
        let removed = self.working.write().remove(local);
        if removed {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Remove the document indexed by `term`; false if none did
    pub fn delete_document_term(&self, term: &str) -> bool {
        let mut state = self.working.write();
        let Some(local) = state.find(term) else {
            return false;
        };
        state.remove(local);
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Set metadata; an empty value removes the key
    pub fn set_metadata(&self, key: &str, value: &[u8]) {
        let mut state = self.working.write();
        if value.is_empty() {
            state.metadata.remove(key);
        } else {
            state.metadata.insert(key.to_string(), value.to_vec());
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Append `blob` to the volume, returning its offset
    pub fn append_blob(&self, blob: &[u8]) -> u64 {
        let mut volume = self.volume.write();
        let offset = volume.len() as u64;
        volume.extend_from_slice(blob);
        offset
    }

    /// Read `size` bytes at `offset` from the volume
    pub fn read_blob(&self, offset: u64, size: u64) -> Option<Vec<u8>> {
        let volume = self.volume.read();
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;
        volume.get(start..end).map(<[u8]>::to_vec)
    }

    /// Publish the working state; false if there was nothing to publish
    pub fn commit(&self) -> bool {
        let state = self.working.read();
        if !self.dirty.load(Ordering::Acquire) {
            return false;
        }
        let revision = self.revision.load(Ordering::Acquire) + 1;
        let snapshot = Arc::new(ShardSnapshot {
            revision,
            state: state.clone(),
        });
        *self.committed.write() = snapshot;
        self.revision.store(revision, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        debug!(target: "vellum::storage", shard = %self.endpoint, revision, "Committed");
        true
    }
}

/// Check the version `doc` carries against `current` and stamp the next one
///
/// A document without a version overwrites unconditionally. A document with
/// a version must match the stored one exactly.
fn resolve_version(
    label: &str,
    current: Option<&NativeDocument>,
    doc: &mut NativeDocument,
) -> VellumResult<()> {
    let stored = current.and_then(NativeDocument::version);
    let next = match doc.version() {
        Some(expected) => {
            if stored != Some(expected) {
                return Err(VellumError::soft_conflict(
                    label,
                    format!(
                        "Version mismatch! expected {}, stored {}",
                        expected,
                        stored.map_or_else(|| "none".to_string(), |v| v.to_string())
                    ),
                ));
            }
            expected.next()
        }
        None => stored.map_or(VersionToken::INITIAL, |v| v.next()),
    };
    doc.set_version(next);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with(term: &str) -> NativeDocument {
        let mut doc = NativeDocument::new();
        doc.add_boolean_term(term);
        doc
    }

    #[test]
    fn test_replace_by_term_allocates_and_versions() {
        let shard = Shard::new(Endpoint::new("s0"));
        let first = shard.replace_document_term("QKa", doc_with("QKa")).unwrap();
        let second = shard.replace_document_term("QKb", doc_with("QKb")).unwrap();
        assert_eq!((first, second), (1, 2));

        let again = shard.replace_document_term("QKa", doc_with("QKa")).unwrap();
        assert_eq!(again, 1);
        let stored = shard.with_working(|s| s.get(1)).unwrap();
        assert_eq!(stored.version(), Some(VersionToken(2)));
    }

    #[test]
    fn test_stale_version_is_soft_conflict() {
        let shard = Shard::new(Endpoint::new("s0"));
        shard.replace_document_term("QKa", doc_with("QKa")).unwrap();

        let mut stale = doc_with("QKa");
        stale.set_version(VersionToken(7));
        let err = shard.replace_document_term("QKa", stale).unwrap_err();
        assert!(err.is_soft_conflict());

        let mut fresh = doc_with("QKa");
        fresh.set_version(VersionToken::INITIAL);
        shard.replace_document_term("QKa", fresh).unwrap();
    }

    #[test]
    fn test_versioned_write_on_missing_document_conflicts() {
        let shard = Shard::new(Endpoint::new("s0"));
        let mut doc = doc_with("QKa");
        doc.set_version(VersionToken::INITIAL);
        assert!(shard.replace_document_term("QKa", doc).is_err());
    }

    #[test]
    fn test_replace_drops_old_postings() {
        let shard = Shard::new(Endpoint::new("s0"));
        let mut doc = doc_with("QKa");
        doc.add_term("Tred", 1);
        shard.replace_document_term("QKa", doc).unwrap();
        shard.replace_document_term("QKa", doc_with("QKa")).unwrap();
        assert_eq!(shard.with_working(|s| s.find("Tred")), None);
        assert_eq!(shard.with_working(|s| s.find("QKa")), Some(1));
    }

    #[test]
    fn test_commit_publishes_snapshot() {
        let shard = Shard::new(Endpoint::new("s0"));
        shard.replace_document_term("QKa", doc_with("QKa")).unwrap();
        assert_eq!(shard.snapshot().state().doc_count(), 0);

        assert!(shard.commit());
        assert!(!shard.commit());
        assert_eq!(shard.revision(), 1);
        assert_eq!(shard.snapshot().state().doc_count(), 1);
    }

    #[test]
    fn test_delete_and_ids_not_reused() {
        let shard = Shard::new(Endpoint::new("s0"));
        shard.replace_document_term("QKa", doc_with("QKa")).unwrap();
        assert!(shard.delete_document_term("QKa"));
        assert!(!shard.delete_document_term("QKa"));
        let next = shard.replace_document_term("QKb", doc_with("QKb")).unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn test_metadata_empty_value_removes() {
        let shard = Shard::new(Endpoint::new("s0"));
        shard.set_metadata("k", b"v");
        assert_eq!(shard.with_working(|s| s.metadata("k")), b"v".to_vec());
        shard.set_metadata("k", b"");
        assert!(shard.with_working(|s| s.metadata_keys()).is_empty());
    }

    #[test]
    fn test_volume_append_and_read() {
        let shard = Shard::new(Endpoint::new("s0"));
        let a = shard.append_blob(b"hello");
        let b = shard.append_blob(b"world");
        assert_eq!(a, 0);
        assert_eq!(shard.read_blob(b, 5).unwrap(), b"world".to_vec());
        assert!(shard.read_blob(8, 5).is_none());
    }
}
