//! Retrying read accessor for one stored document
//!
//! Every read fetches the backend document and retries the whole read when
//! a read-only checkout reports a concurrent modification, reopening the
//! checkout in between. A `Document` without a handler is detached and
//! answers every read with an empty default.

use serde_json::{Map, Value};
use std::sync::atomic::Ordering;
use tracing::debug;
use vellum_core::{InternalId, VellumResult, VersionToken};
use vellum_durability::Data;
use vellum_storage::NativeDocument;
use xxhash_rust::xxh3::xxh3_64;

use crate::handler::DatabaseHandler;

const RESPONSE_WDF: &str = "_wdf";
const RESPONSE_POS: &str = "_pos";

/// Handle to a document by internal id
#[derive(Debug, Clone)]
pub struct Document {
    did: InternalId,
    handler: Option<DatabaseHandler>,
}

impl Document {
    /// Document `did` read through `handler`
    pub fn new(did: InternalId, handler: Option<DatabaseHandler>) -> Self {
        Document { did, handler }
    }

    /// Internal id
    pub fn get_docid(&self) -> InternalId {
        self.did
    }

    /// Run `f` on the current backend document, retrying up to `retries`
    /// extra times on concurrent modification
    fn read<R>(
        &self,
        retries: usize,
        f: impl Fn(&NativeDocument) -> VellumResult<R>,
    ) -> VellumResult<Option<R>> {
        let Some(handler) = &self.handler else {
            return Ok(None);
        };
        let store = handler.store();
        let mut left = retries;
        loop {
            match store.get_document(self.did, true).and_then(|doc| f(&*doc)) {
                Err(e) if e.is_concurrent_modification() && left > 0 => {
                    left -= 1;
                    handler
                        .engine()
                        .counters
                        .read_retries
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(target: "vellum::document", did = %self.did, left, "Reopening after concurrent modification");
                    store.reopen()?;
                }
                other => return other.map(Some),
            }
        }
    }

    fn default_retries(&self) -> usize {
        self.handler
            .as_ref()
            .map_or(0, DatabaseHandler::read_retries)
    }

    /// Serialized backend document
    pub fn serialise(&self, retries: usize) -> VellumResult<Vec<u8>> {
        Ok(self
            .read(retries, NativeDocument::serialise)?
            .unwrap_or_default())
    }

    /// Raw value in `slot`; empty when unset
    pub fn get_value(&self, slot: u32, retries: usize) -> VellumResult<Vec<u8>> {
        Ok(self
            .read(retries, |doc| Ok(doc.value(slot).map(<[u8]>::to_vec)))?
            .flatten()
            .unwrap_or_default())
    }

    /// Serialized data envelope
    pub fn get_data(&self, retries: usize) -> VellumResult<Vec<u8>> {
        Ok(self
            .read(retries, |doc| Ok(doc.data().to_vec()))?
            .unwrap_or_default())
    }

    /// Version token
    pub fn get_version(&self) -> VellumResult<Option<VersionToken>> {
        Ok(self
            .read(self.default_retries(), |doc| Ok(doc.version()))?
            .flatten())
    }

    /// Data envelope carrying the version it was read at
    ///
    /// Both come from the same fetch, so a write based on the envelope
    /// conflicts if the document changed after this read.
    pub fn get_envelope(&self) -> VellumResult<Data> {
        Ok(self
            .read(self.default_retries(), |doc| {
                Data::deserialise(doc.data(), doc.version())
            })?
            .unwrap_or_default())
    }

    /// Terms with their within-document frequency and positions
    pub fn get_terms(&self, retries: usize) -> VellumResult<Value> {
        let terms = self.read(retries, |doc| {
            let mut terms = Map::new();
            for (term, entry) in doc.terms() {
                let mut info = Map::new();
                info.insert(RESPONSE_WDF.to_string(), Value::from(entry.wdf));
                if !entry.positions.is_empty() {
                    info.insert(RESPONSE_POS.to_string(), Value::from(entry.positions.clone()));
                }
                terms.insert(term.to_string(), Value::Object(info));
            }
            Ok(terms)
        })?;
        Ok(Value::Object(terms.unwrap_or_default()))
    }

    /// Values keyed by slot number
    pub fn get_values(&self, retries: usize) -> VellumResult<Value> {
        let values = self.read(retries, |doc| {
            let mut values = Map::new();
            for (slot, value) in doc.values() {
                values.insert(slot.to_string(), Value::from(value.to_vec()));
            }
            Ok(values)
        })?;
        Ok(Value::Object(values.unwrap_or_default()))
    }

    /// Stored object; an empty map when the document has none
    pub fn get_obj(&self) -> VellumResult<Value> {
        self.get_envelope()?.get_obj()
    }

    /// Top-level field `name` of the stored object; null when absent
    pub fn get_field(&self, name: &str) -> VellumResult<Value> {
        Ok(Self::field_of(&self.get_obj()?, name))
    }

    /// Top-level field `name` of `obj`; null when absent
    pub fn field_of(obj: &Value, name: &str) -> Value {
        obj.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Content fingerprint of the stored document
    ///
    /// Combines every value (weighted by slot), every term (weighted by its
    /// frequency, then its positions) and the data envelope.
    pub fn hash(&self, retries: usize) -> VellumResult<u64> {
        let hash = self.read(retries, |doc| {
            let mut hash = 0u64;
            for (slot, value) in doc.values() {
                hash ^= xxh3_64(value).wrapping_mul(u64::from(slot) + 1);
            }
            for (term, entry) in doc.terms() {
                let term_hash = xxh3_64(term.as_bytes());
                hash ^= term_hash.wrapping_mul(u64::from(entry.wdf));
                for &pos in &entry.positions {
                    hash ^= term_hash.wrapping_mul(u64::from(pos) + 1);
                }
            }
            hash ^= xxh3_64(doc.data());
            Ok(hash)
        })?;
        Ok(hash.unwrap_or_default())
    }
}
