//! Backend document representation
//!
//! A `NativeDocument` is what the storage engine persists for one document:
//! an opaque data blob (the serialized Data envelope), numbered value slots,
//! and a term list with within-document frequencies and positions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vellum_core::{VellumResult, VersionToken};

/// Value slot holding the serialized external id
pub const SLOT_ID: u32 = 0;

/// Value slot holding the document's VersionToken
pub const SLOT_VERSION: u32 = 1;

/// First slot available to schema fields
pub const SLOT_FIRST_FIELD: u32 = 16;

/// Per-document statistics for one term
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermEntry {
    /// Within-document frequency
    pub wdf: u32,
    /// Token positions, ascending
    pub positions: Vec<u32>,
}

/// Mutable backend document: terms + values + payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeDocument {
    data: Vec<u8>,
    values: BTreeMap<u32, Vec<u8>>,
    terms: BTreeMap<String, TermEntry>,
}

impl NativeDocument {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialized data envelope
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the serialized data envelope
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Value stored in `slot`, if any
    pub fn value(&self, slot: u32) -> Option<&[u8]> {
        self.values.get(&slot).map(Vec::as_slice)
    }

    /// Set the value of `slot`
    pub fn add_value(&mut self, slot: u32, value: Vec<u8>) {
        self.values.insert(slot, value);
    }

    /// Clear the value of `slot`
    pub fn remove_value(&mut self, slot: u32) {
        self.values.remove(&slot);
    }

    /// All values in slot order
    pub fn values(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.values.iter().map(|(slot, v)| (*slot, v.as_slice()))
    }

    /// Number of populated slots
    pub fn values_count(&self) -> usize {
        self.values.len()
    }

    /// Add `wdf_inc` occurrences of `term` without positional information
    pub fn add_term(&mut self, term: impl Into<String>, wdf_inc: u32) {
        let entry = self.terms.entry(term.into()).or_default();
        entry.wdf += wdf_inc;
    }

    /// Add one positional occurrence of `term`
    pub fn add_posting(&mut self, term: impl Into<String>, position: u32, wdf_inc: u32) {
        let entry = self.terms.entry(term.into()).or_default();
        entry.wdf += wdf_inc;
        if let Err(idx) = entry.positions.binary_search(&position) {
            entry.positions.insert(idx, position);
        }
    }

    /// Add a term with zero frequency (filtering only)
    pub fn add_boolean_term(&mut self, term: impl Into<String>) {
        self.terms.entry(term.into()).or_default();
    }

    /// True if the document indexes `term`
    pub fn has_term(&self, term: &str) -> bool {
        self.terms.contains_key(term)
    }

    /// All terms in lexical order
    pub fn terms(&self) -> impl Iterator<Item = (&str, &TermEntry)> {
        self.terms.iter().map(|(t, e)| (t.as_str(), e))
    }

    /// Number of distinct terms
    pub fn termlist_count(&self) -> usize {
        self.terms.len()
    }

    /// Version token stored in [`SLOT_VERSION`]
    pub fn version(&self) -> Option<VersionToken> {
        self.value(SLOT_VERSION).and_then(VersionToken::unserialise)
    }

    /// Store `version` in [`SLOT_VERSION`]
    pub fn set_version(&mut self, version: VersionToken) {
        self.add_value(SLOT_VERSION, version.serialise());
    }

    /// Encode as MessagePack
    pub fn serialise(&self) -> VellumResult<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decode from MessagePack
    pub fn unserialise(bytes: &[u8]) -> VellumResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terms_accumulate_wdf_and_positions() {
        let mut doc = NativeDocument::new();
        doc.add_posting("Tfox", 3, 1);
        doc.add_posting("Tfox", 1, 1);
        doc.add_posting("Tfox", 3, 1);
        let (_, entry) = doc.terms().find(|(t, _)| *t == "Tfox").unwrap();
        assert_eq!(entry.wdf, 3);
        assert_eq!(entry.positions, vec![1, 3]);
    }

    #[test]
    fn test_boolean_term_has_zero_wdf() {
        let mut doc = NativeDocument::new();
        doc.add_boolean_term("QKdoc");
        assert!(doc.has_term("QKdoc"));
        assert_eq!(doc.terms().next().unwrap().1.wdf, 0);
    }

    #[test]
    fn test_version_slot() {
        let mut doc = NativeDocument::new();
        assert_eq!(doc.version(), None);
        doc.set_version(VersionToken(7));
        assert_eq!(doc.version(), Some(VersionToken(7)));
    }

    #[test]
    fn test_serialise_roundtrip() {
        let mut doc = NativeDocument::new();
        doc.set_data(b"payload".to_vec());
        doc.add_value(SLOT_FIRST_FIELD, vec![1, 2, 3]);
        doc.add_term("Kcolor:red", 1);
        let bytes = doc.serialise().unwrap();
        assert_eq!(NativeDocument::unserialise(&bytes).unwrap(), doc);
    }
}
