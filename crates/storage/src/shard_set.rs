//! Shard set: one checkout over an ordered list of shards
//!
//! # Design
//!
//! - Internal ids are interleaved: local id `l` of shard `s` in a set of `n`
//!   shards is global id `(l - 1) * n + s + 1`
//! - A new document goes to shard `xxh3(term) % n`; an existing one stays
//!   wherever its term is already indexed
//! - Writable sets read and write the shards' working state
//! - Read-only sets pin one committed snapshot per shard at open and on
//!   `reopen()`; reads through a pinned snapshot that is two or more
//!   revisions behind fail with `ConcurrentModification`
//! - Metadata lives on the first shard

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use vellum_core::{Endpoints, InternalId, StoredLocation, TermId, VellumError, VellumResult};
use xxhash_rust::xxh3::xxh3_64;

use crate::document::NativeDocument;
use crate::shard::{Shard, ShardSnapshot, ShardState};
use crate::traits::{DocumentStore, StoreStats};

/// A checkout of one or more shards
pub struct ShardSet {
    endpoints: Endpoints,
    shards: Vec<Arc<Shard>>,
    writable: bool,
    views: Mutex<Vec<Arc<ShardSnapshot>>>,
}

impl ShardSet {
    /// Check out `shards` (in endpoint order)
    pub fn new(endpoints: Endpoints, shards: Vec<Arc<Shard>>, writable: bool) -> Self {
        debug_assert_eq!(endpoints.len(), shards.len());
        let views = shards.iter().map(|s| s.snapshot()).collect();
        ShardSet {
            endpoints,
            shards,
            writable,
            views: Mutex::new(views),
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn to_global(&self, shard: usize, local: u64) -> InternalId {
        InternalId((local - 1) * self.shards.len() as u64 + shard as u64 + 1)
    }

    fn to_local(&self, did: InternalId) -> VellumResult<(usize, u64)> {
        if did.as_u64() == 0 {
            return Err(VellumError::DocumentNotFound(format!("::{}", did)));
        }
        let n = self.shards.len() as u64;
        let zero_based = did.as_u64() - 1;
        Ok(((zero_based % n) as usize, zero_based / n + 1))
    }

    fn route(&self, term: &TermId) -> usize {
        (xxh3_64(term.as_str().as_bytes()) % self.shards.len() as u64) as usize
    }

    /// Shard holding `term`, or the shard a new document with it goes to
    fn locate(&self, term: &TermId) -> usize {
        self.shards
            .iter()
            .position(|s| s.with_working(|state| state.find(term.as_str()).is_some()))
            .unwrap_or_else(|| self.route(term))
    }

    fn check_writable(&self) -> VellumResult<()> {
        if !self.writable {
            return Err(VellumError::client(format!(
                "Database {} is read-only",
                self.endpoints
            )));
        }
        Ok(())
    }

    /// Run `f` on the state this checkout reads from for shard `idx`
    fn read<R>(&self, idx: usize, f: impl FnOnce(&ShardState) -> R) -> VellumResult<R> {
        let shard = &self.shards[idx];
        if self.writable {
            return Ok(shard.with_working(f));
        }
        let view = Arc::clone(&self.views.lock()[idx]);
        if shard.revision() >= view.revision() + 2 {
            return Err(VellumError::ConcurrentModification(format!(
                "The revision being read of {} has been discarded - reopen and retry",
                shard.endpoint()
            )));
        }
        Ok(f(view.state()))
    }

    fn commit_if(&self, commit: bool) -> VellumResult<()> {
        if commit {
            self.commit(false)?;
        }
        Ok(())
    }
}

impl DocumentStore for ShardSet {
    fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn find_document(&self, term: &TermId) -> VellumResult<InternalId> {
        for idx in 0..self.shards.len() {
            if let Some(local) = self.read(idx, |s| s.find(term.as_str()))? {
                return Ok(self.to_global(idx, local));
            }
        }
        Err(VellumError::DocumentNotFound(term.to_string()))
    }

    fn get_document(&self, did: InternalId, assume_valid: bool) -> VellumResult<Arc<NativeDocument>> {
        if !assume_valid && !self.writable {
            self.reopen()?;
        }
        let (idx, local) = self.to_local(did)?;
        self.read(idx, |s| s.get(local))?
            .ok_or_else(|| VellumError::DocumentNotFound(format!("::{}", did)))
    }

    fn replace_document(
        &self,
        did: InternalId,
        doc: NativeDocument,
        commit: bool,
    ) -> VellumResult<InternalId> {
        self.check_writable()?;
        let (idx, local) = self.to_local(did)?;
        self.shards[idx].replace_document(local, doc, &format!("::{}", did))?;
        self.commit_if(commit)?;
        Ok(did)
    }

    fn replace_document_term(
        &self,
        term: &TermId,
        doc: NativeDocument,
        commit: bool,
    ) -> VellumResult<InternalId> {
        self.check_writable()?;
        if term.is_empty() {
            return Err(VellumError::client("Document must have an 'id'"));
        }
        let idx = self.locate(term);
        let local = self.shards[idx].replace_document_term(term.as_str(), doc)?;
        self.commit_if(commit)?;
        Ok(self.to_global(idx, local))
    }

    fn delete_document(&self, did: InternalId, commit: bool) -> VellumResult<()> {
        self.check_writable()?;
        let (idx, local) = self.to_local(did)?;
        if !self.shards[idx].delete_document(local) {
            return Err(VellumError::DocumentNotFound(format!("::{}", did)));
        }
        self.commit_if(commit)
    }

    fn delete_document_term(&self, term: &TermId, commit: bool) -> VellumResult<()> {
        self.check_writable()?;
        let deleted = self
            .shards
            .iter()
            .any(|shard| shard.delete_document_term(term.as_str()));
        if !deleted {
            return Err(VellumError::DocumentNotFound(term.to_string()));
        }
        self.commit_if(commit)
    }

    fn get_metadata(&self, key: &str) -> VellumResult<Vec<u8>> {
        self.read(0, |s| s.metadata(key))
    }

    fn set_metadata(&self, key: &str, value: &[u8], commit: bool) -> VellumResult<()> {
        self.check_writable()?;
        self.shards[0].set_metadata(key, value);
        self.commit_if(commit)
    }

    fn metadata_keys(&self) -> VellumResult<Vec<String>> {
        self.read(0, ShardState::metadata_keys)
    }

    fn store_blob(&self, term: &TermId, blob: &[u8]) -> VellumResult<StoredLocation> {
        self.check_writable()?;
        let idx = self.locate(term);
        let offset = self.shards[idx].append_blob(blob);
        Ok(StoredLocation {
            volume: 0,
            offset,
            size: blob.len() as u64,
        })
    }

    fn get_stored(&self, did: InternalId, location: StoredLocation) -> VellumResult<Vec<u8>> {
        let (idx, _) = self.to_local(did)?;
        self.shards[idx]
            .read_blob(location.offset, location.size)
            .ok_or_else(|| {
                VellumError::storage(format!(
                    "Stored blob {}:{}+{} of ::{} is out of range",
                    location.volume, location.offset, location.size, did
                ))
            })
    }

    fn reopen(&self) -> VellumResult<bool> {
        if self.writable {
            return Ok(false);
        }
        let mut views = self.views.lock();
        let mut changed = false;
        for (view, shard) in views.iter_mut().zip(&self.shards) {
            if view.revision() != shard.revision() {
                *view = shard.snapshot();
                changed = true;
            }
        }
        if changed {
            debug!(target: "vellum::storage", endpoints = %self.endpoints, "Reopened");
        }
        Ok(changed)
    }

    fn commit(&self, flush_wal: bool) -> VellumResult<bool> {
        self.check_writable()?;
        let mut committed = false;
        for shard in &self.shards {
            committed |= shard.commit();
        }
        if committed {
            debug!(target: "vellum::storage", endpoints = %self.endpoints, flush_wal, "Commit");
        }
        Ok(committed)
    }

    fn export_documents(&self) -> VellumResult<Vec<(InternalId, Arc<NativeDocument>)>> {
        let mut out = Vec::new();
        for idx in 0..self.shards.len() {
            let docs: Vec<(u64, Arc<NativeDocument>)> = self.read(idx, |s| {
                s.documents()
                    .map(|(local, doc)| (local, Arc::clone(doc)))
                    .collect()
            })?;
            out.extend(
                docs.into_iter()
                    .map(|(local, doc)| (self.to_global(idx, local), doc)),
            );
        }
        out.sort_by_key(|(did, _)| *did);
        Ok(out)
    }

    fn stats(&self) -> VellumResult<StoreStats> {
        let mut stats = StoreStats::default();
        for (idx, shard) in self.shards.iter().enumerate() {
            let (count, last) = self.read(idx, |s| (s.doc_count(), s.last_local_id()))?;
            stats.doc_count += count;
            if last > 0 {
                stats.last_docid = stats.last_docid.max(self.to_global(idx, last).as_u64());
            }
            stats.revision += shard.revision();
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("endpoints", &self.endpoints.to_string())
            .field("writable", &self.writable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vellum_core::{Endpoint, VersionToken};

    fn shards(n: usize) -> (Endpoints, Vec<Arc<Shard>>) {
        let eps: Vec<Endpoint> = (0..n).map(|i| Endpoint::new(format!("s{}", i))).collect();
        let shards = eps.iter().map(|e| Arc::new(Shard::new(e.clone()))).collect();
        (Endpoints::new(eps), shards)
    }

    fn doc(term: &str) -> NativeDocument {
        let mut d = NativeDocument::new();
        d.add_boolean_term(term);
        d
    }

    #[test]
    fn test_interleaved_ids_map_back_to_shard() {
        let (eps, shards) = shards(3);
        let set = ShardSet::new(eps, shards, true);
        for i in 0..20 {
            let term = TermId::new(format!("QKdoc{}", i));
            let did = set.replace_document_term(&term, doc(term.as_str()), false).unwrap();
            assert_eq!(set.find_document(&term).unwrap(), did);
            let (idx, _) = set.to_local(did).unwrap();
            assert_eq!(idx, did.shard_index(3));
        }
        assert_eq!(set.stats().unwrap().doc_count, 20);
    }

    #[test]
    fn test_read_only_sees_commits_after_reopen() {
        let (eps, shards) = shards(1);
        let writer = ShardSet::new(eps.clone(), shards.clone(), true);
        let reader = ShardSet::new(eps, shards, false);
        let term = TermId::new("QKa");

        let did = writer.replace_document_term(&term, doc("QKa"), true).unwrap();
        assert!(reader.get_document(did, true).unwrap_err().is_not_found());
        assert!(reader.reopen().unwrap());
        assert!(reader.get_document(did, true).is_ok());
    }

    #[test]
    fn test_stale_reader_gets_concurrent_modification() {
        let (eps, shards) = shards(1);
        let writer = ShardSet::new(eps.clone(), shards.clone(), true);
        let reader = ShardSet::new(eps, shards, false);
        let term = TermId::new("QKa");

        let did = writer.replace_document_term(&term, doc("QKa"), true).unwrap();
        reader.reopen().unwrap();
        writer.replace_document_term(&term, doc("QKa"), true).unwrap();
        writer.replace_document_term(&term, doc("QKa"), true).unwrap();

        let err = reader.get_document(did, true).unwrap_err();
        assert!(err.is_concurrent_modification());
        let fresh = reader.get_document(did, false).unwrap();
        assert_eq!(fresh.version(), Some(VersionToken(3)));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let (eps, shards) = shards(1);
        let reader = ShardSet::new(eps, shards, false);
        let err = reader
            .replace_document_term(&TermId::new("QKa"), doc("QKa"), false)
            .unwrap_err();
        assert!(err.is_client());
    }

    #[test]
    fn test_stored_blob_roundtrip() {
        let (eps, shards) = shards(2);
        let set = ShardSet::new(eps, shards, true);
        let term = TermId::new("QKblob");
        let loc = set.store_blob(&term, b"big payload").unwrap();
        let did = set.replace_document_term(&term, doc("QKblob"), false).unwrap();
        assert_eq!(set.get_stored(did, loc).unwrap(), b"big payload".to_vec());
    }

    #[test]
    fn test_export_is_ordered() {
        let (eps, shards) = shards(2);
        let set = ShardSet::new(eps, shards, true);
        for i in 0..6 {
            let term = TermId::new(format!("QK{}", i));
            set.replace_document_term(&term, doc(term.as_str()), false).unwrap();
        }
        let ids: Vec<u64> = set
            .export_documents()
            .unwrap()
            .iter()
            .map(|(d, _)| d.as_u64())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 6);
    }

    proptest! {
        #[test]
        fn prop_global_local_mapping_is_bijective(n in 1usize..8, shard in 0usize..8, local in 1u64..10_000) {
            prop_assume!(shard < n);
            let (eps, shards) = shards(n);
            let set = ShardSet::new(eps, shards, true);
            let did = set.to_global(shard, local);
            prop_assert_eq!(set.to_local(did).unwrap(), (shard, local));
            prop_assert_eq!(did.shard_index(n), shard);
        }
    }
}
