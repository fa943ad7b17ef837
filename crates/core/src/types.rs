//! Core types for the vellum document store
//!
//! This module defines the foundational types:
//! - InternalId: storage-assigned numeric document id
//! - TermId: unique term derived from a document's external id
//! - VersionToken: optimistic concurrency token stored with each document
//! - Endpoint / Endpoints: shard addressing
//! - OpenFlags / Method: how a handler is allowed to touch its shards

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque numeric id assigned by the storage engine on first write
///
/// Ids start at 1 and are interleaved across the shards of a shard set, so
/// the shard that owns a document is `(id - 1) mod shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InternalId(pub u64);

impl InternalId {
    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Index of the owning shard within a set of `shard_count` shards
    pub fn shard_index(&self, shard_count: usize) -> usize {
        debug_assert!(self.0 > 0, "internal ids start at 1");
        ((self.0.saturating_sub(1)) % shard_count.max(1) as u64) as usize
    }

    /// Parse the `::<n>` literal form callers use to address a document by
    /// its internal id. Returns `Ok(None)` when `s` is not in that form.
    pub fn parse_literal(s: &str) -> Result<Option<Self>, String> {
        match s.strip_prefix("::") {
            Some(digits) if !digits.is_empty() => digits
                .parse::<u64>()
                .map(|n| Some(InternalId(n)))
                .map_err(|e| format!("Value {:?} cannot be cast to integer [{}]", digits, e)),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique-term string derived from a document's external id
///
/// An empty TermId never names a document; the bulk pipeline uses it as a
/// sentinel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TermId(String);

impl TermId {
    /// Wrap an already prefixed term
    pub fn new(term: impl Into<String>) -> Self {
        TermId(term.into())
    }

    /// The empty sentinel term
    pub fn empty() -> Self {
        TermId(String::new())
    }

    /// Borrow the term text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the sentinel
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TermId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque, monotonically ordered document version
///
/// Stored in the document's version value slot using a big-endian encoding
/// so byte order matches numeric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionToken(pub u64);

impl VersionToken {
    /// Version of a freshly created document
    pub const INITIAL: VersionToken = VersionToken(1);

    /// The version that follows this one
    pub fn next(&self) -> Self {
        VersionToken(self.0 + 1)
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Encode for a value slot
    pub fn serialise(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    /// Decode from a value slot; `None` on empty or malformed input
    pub fn unserialise(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(VersionToken(u64::from_be_bytes(arr)))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a `stored` blob lives inside a shard volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredLocation {
    /// Volume number
    pub volume: u32,
    /// Byte offset inside the volume
    pub offset: u64,
    /// Blob length
    pub size: u64,
}

/// Address of one shard
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Shard path, unique within the process
    pub path: String,
}

impl Endpoint {
    /// Create an endpoint for `path`
    pub fn new(path: impl Into<String>) -> Self {
        Endpoint { path: path.into() }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Ordered set of shard endpoints a handler operates on
///
/// The order matters: it defines shard numbers and id interleaving.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Endpoints(Vec<Endpoint>);

impl Endpoints {
    /// Create from an ordered list of endpoints
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Endpoints(endpoints)
    }

    /// Single-shard set
    pub fn single(path: impl Into<String>) -> Self {
        Endpoints(vec![Endpoint::new(path)])
    }

    /// Number of shards
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no shards
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate endpoints in shard order
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.0.iter()
    }

    /// Endpoint of shard `index`
    pub fn get(&self, index: usize) -> Option<&Endpoint> {
        self.0.get(index)
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, endpoint) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{}", endpoint)?;
        }
        Ok(())
    }
}

impl FromStr for Endpoints {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let endpoints: Vec<Endpoint> = s
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Endpoint::new)
            .collect();
        if endpoints.is_empty() {
            return Err("It is expected at least one endpoint".to_string());
        }
        Ok(Endpoints(endpoints))
    }
}

/// Access mode a handler requests on its shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Writes are allowed
    pub writable: bool,
    /// Missing shards are created on open
    pub create: bool,
}

impl OpenFlags {
    /// Shared, read-only access; missing shards are an error
    pub const READ_ONLY: OpenFlags = OpenFlags {
        writable: false,
        create: false,
    };

    /// Exclusive write access, creating shards on demand
    pub const WRITABLE: OpenFlags = OpenFlags {
        writable: true,
        create: true,
    };
}

/// Request verb a handler was created for
///
/// Passed through to script hooks so they can distinguish a replace from a
/// partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read
    Get,
    /// Search / bulk submission
    Post,
    /// Full replace
    Put,
    /// Structured patch
    Patch,
    /// Shallow merge
    Update,
    /// Legacy spelling of `Update`
    Merge,
    /// Removal
    Delete,
}

impl Method {
    /// Upper-case verb name
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Update | Method::Merge => "UPDATE",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reserved object field names
pub mod fields {
    /// External document id
    pub const ID: &str = "_id";
    /// Resolved version token in results, expected version in requests
    pub const VERSION: &str = "_version";
    /// Blob payload injection
    pub const DATA: &str = "_data";
    /// Blob bytes inside a `_data` entry
    pub const BLOB: &str = "_blob";
    /// Content type inside a `_data` entry
    pub const CONTENT_TYPE: &str = "_content_type";
    /// `"inplace"` or `"stored"` inside a `_data` entry
    pub const TYPE: &str = "_type";
    /// Bulk operation selector
    pub const OP_TYPE: &str = "_op_type";
    /// Wrapped scalar inside a map-valued field
    pub const VALUE: &str = "_value";
    /// Diagnostic: internal id
    pub const DOCUMENT_ID: &str = "_document_id";
    /// Diagnostic: owning shard
    pub const SHARD: &str = "_shard";
    /// Per-item error status
    pub const STATUS: &str = "_status";
    /// Per-item error message lines
    pub const MESSAGE: &str = "_message";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_index_interleaving() {
        assert_eq!(InternalId(1).shard_index(3), 0);
        assert_eq!(InternalId(2).shard_index(3), 1);
        assert_eq!(InternalId(3).shard_index(3), 2);
        assert_eq!(InternalId(4).shard_index(3), 0);
        assert_eq!(InternalId(7).shard_index(1), 0);
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(InternalId::parse_literal("::42").unwrap(), Some(InternalId(42)));
        assert_eq!(InternalId::parse_literal("doc-1").unwrap(), None);
        assert_eq!(InternalId::parse_literal("::").unwrap(), None);
        assert!(InternalId::parse_literal("::abc").is_err());
    }

    #[test]
    fn test_version_token_slot_encoding() {
        let v = VersionToken(258);
        let bytes = v.serialise();
        assert_eq!(bytes.len(), 8);
        assert_eq!(VersionToken::unserialise(&bytes), Some(v));
        assert_eq!(VersionToken::unserialise(b""), None);
        assert!(VersionToken(2).serialise() > VersionToken(1).serialise());
    }

    #[test]
    fn test_version_token_next() {
        assert_eq!(VersionToken::INITIAL.next(), VersionToken(2));
    }

    #[test]
    fn test_endpoints_display_and_parse() {
        let eps: Endpoints = "a; b;c".parse().unwrap();
        assert_eq!(eps.len(), 3);
        assert_eq!(eps.to_string(), "a;b;c");
        assert!("".parse::<Endpoints>().is_err());
    }

    #[test]
    fn test_term_id_sentinel() {
        assert!(TermId::empty().is_empty());
        assert!(!TermId::new("QKdoc").is_empty());
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Method::Merge.as_str(), "UPDATE");
        assert_eq!(Method::Put.to_string(), "PUT");
    }
}
