//! Data envelope: a document's payload fragments
//!
//! A document's data blob holds one `Locator` per content type. The fragment
//! with the empty content type is the document object itself, encoded as
//! MessagePack. Every other fragment is a user blob injected through `_data`
//! or a raw body.
//!
//! ## Placement
//!
//! | Placement | Tag | Bytes live in |
//! |-----------|-----|---------------|
//! | `Inline` | 0 | the envelope |
//! | `InlineCompressed` | 1 | the envelope, zstd |
//! | `Stored` | 2 | a shard volume |
//! | `StoredCompressed` | 3 | a shard volume, zstd |
//!
//! A `stored` fragment that has not been written to a volume yet is
//! *pending*: it carries its bytes and no location. The write path moves
//! pending bytes into the shard volume before the document is committed.
//!
//! The version token is carried alongside the envelope but never serialized
//! with it; it lives in the document's version slot.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vellum_core::{validate_inline_size, StoredLocation, VellumError, VellumResult, VersionToken};

/// Blobs at least this large are zstd-compressed when that saves space
pub const COMPRESSION_THRESHOLD: usize = 4 * 1024;

/// zstd compression level for envelope fragments
pub const COMPRESSION_LEVEL: i32 = 3;

/// Where a fragment's bytes are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    /// Raw bytes inside the envelope
    Inline,
    /// zstd bytes inside the envelope
    InlineCompressed,
    /// Raw bytes in a shard volume
    Stored,
    /// zstd bytes in a shard volume
    StoredCompressed,
}

impl Placement {
    /// One-byte tag used by the dump format
    pub fn tag(&self) -> u8 {
        match self {
            Placement::Inline => 0,
            Placement::InlineCompressed => 1,
            Placement::Stored => 2,
            Placement::StoredCompressed => 3,
        }
    }

    /// Parse a dump tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Placement::Inline),
            1 => Some(Placement::InlineCompressed),
            2 => Some(Placement::Stored),
            3 => Some(Placement::StoredCompressed),
            _ => None,
        }
    }

    /// True for volume placements
    pub fn is_stored(&self) -> bool {
        matches!(self, Placement::Stored | Placement::StoredCompressed)
    }

    /// True for zstd placements
    pub fn is_compressed(&self) -> bool {
        matches!(self, Placement::InlineCompressed | Placement::StoredCompressed)
    }
}

/// One payload fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    content_type: String,
    placement: Placement,
    location: Option<StoredLocation>,
    encoded: Vec<u8>,
}

impl Locator {
    fn inline(content_type: &str, raw: &[u8]) -> VellumResult<Self> {
        let (encoded, compressed) = encode(raw)?;
        Ok(Locator {
            content_type: content_type.to_string(),
            placement: if compressed {
                Placement::InlineCompressed
            } else {
                Placement::Inline
            },
            location: None,
            encoded,
        })
    }

    /// Content type; empty for the document object
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Placement of the bytes
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Volume location of a placed `stored` fragment
    pub fn location(&self) -> Option<StoredLocation> {
        self.location
    }

    /// True for a `stored` fragment not yet written to a volume
    pub fn is_pending(&self) -> bool {
        self.placement.is_stored() && self.location.is_none()
    }

    /// Bytes as kept (possibly compressed); what goes into a volume
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Record where the pending bytes were written and drop them
    pub fn place(&mut self, location: StoredLocation) {
        self.location = Some(location);
        self.encoded = Vec::new();
    }

    /// Decode bytes kept under this locator's placement
    pub fn decode(&self, encoded: &[u8]) -> VellumResult<Vec<u8>> {
        if self.placement.is_compressed() {
            zstd::decode_all(encoded)
                .map_err(|e| VellumError::corruption(format!("zstd decode: {}", e)))
        } else {
            Ok(encoded.to_vec())
        }
    }

    /// Raw content of an inline or pending fragment
    ///
    /// # Errors
    ///
    /// A placed `stored` fragment has no bytes here; fetch them from the
    /// shard volume and call [`Locator::decode`].
    pub fn content(&self) -> VellumResult<Vec<u8>> {
        if self.placement.is_stored() && !self.is_pending() {
            return Err(VellumError::internal(format!(
                "Content of stored {:?} must be read from its volume",
                self.content_type
            )));
        }
        self.decode(&self.encoded)
    }
}

fn encode(raw: &[u8]) -> VellumResult<(Vec<u8>, bool)> {
    if raw.len() >= COMPRESSION_THRESHOLD {
        let compressed = zstd::encode_all(raw, COMPRESSION_LEVEL)
            .map_err(|e| VellumError::internal(format!("zstd encode: {}", e)))?;
        if compressed.len() < raw.len() {
            return Ok((compressed, true));
        }
    }
    Ok((raw.to_vec(), false))
}

/// Document payload envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    locators: Vec<Locator>,
    #[serde(skip)]
    version: Option<VersionToken>,
}

impl Data {
    /// Empty envelope
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty envelope carrying a version
    pub fn with_version(version: Option<VersionToken>) -> Self {
        Data {
            locators: Vec::new(),
            version,
        }
    }

    /// Decode a serialized envelope; empty input is an empty envelope
    pub fn deserialise(bytes: &[u8], version: Option<VersionToken>) -> VellumResult<Self> {
        let mut data = if bytes.is_empty() {
            Data::default()
        } else {
            rmp_serde::from_slice::<Data>(bytes)?
        };
        data.version = version;
        Ok(data)
    }

    /// Encode; an envelope without fragments encodes to nothing
    pub fn serialise(&self) -> VellumResult<Vec<u8>> {
        if self.locators.is_empty() {
            return Ok(Vec::new());
        }
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Version token carried over from the stored document
    pub fn version(&self) -> Option<VersionToken> {
        self.version
    }

    /// Replace the carried version token
    pub fn set_version(&mut self, version: Option<VersionToken>) {
        self.version = version;
    }

    /// True if there are no fragments
    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }

    /// Number of fragments
    pub fn len(&self) -> usize {
        self.locators.len()
    }

    /// Fragments in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Locator> {
        self.locators.iter()
    }

    /// Fragment for `content_type`
    pub fn get(&self, content_type: &str) -> Option<&Locator> {
        self.locators.iter().find(|l| l.content_type == content_type)
    }

    /// Pending `stored` fragments, to be written to a volume
    pub fn pending_stored_mut(&mut self) -> impl Iterator<Item = &mut Locator> {
        self.locators.iter_mut().filter(|l| l.is_pending())
    }

    fn put(&mut self, locator: Locator) {
        match self
            .locators
            .iter_mut()
            .find(|l| l.content_type == locator.content_type)
        {
            Some(slot) => *slot = locator,
            None => self.locators.push(locator),
        }
    }

    /// Set an inline blob for `content_type`
    ///
    /// # Errors
    ///
    /// Client error if `blob` is larger than the inline size limit.
    pub fn update(&mut self, content_type: &str, blob: &[u8]) -> VellumResult<()> {
        validate_inline_size(blob)?;
        let locator = Locator::inline(content_type, blob)?;
        self.put(locator);
        Ok(())
    }

    /// Set a `stored` blob for `content_type`
    ///
    /// With a `location` the blob already lives in a volume and `blob` is
    /// ignored; without one the fragment is pending.
    pub fn update_stored(
        &mut self,
        content_type: &str,
        location: Option<StoredLocation>,
        blob: &[u8],
    ) -> VellumResult<()> {
        let (encoded, compressed) = match location {
            Some(_) => (Vec::new(), false),
            None => encode(blob)?,
        };
        self.put(Locator {
            content_type: content_type.to_string(),
            placement: if compressed {
                Placement::StoredCompressed
            } else {
                Placement::Stored
            },
            location,
            encoded,
        });
        Ok(())
    }

    /// Remove the fragment for `content_type`
    pub fn erase(&mut self, content_type: &str) -> bool {
        let before = self.locators.len();
        self.locators.retain(|l| l.content_type != content_type);
        before != self.locators.len()
    }

    /// Document object; an empty map when unset
    pub fn get_obj(&self) -> VellumResult<Value> {
        match self.get("") {
            Some(locator) => {
                let bytes = locator.content()?;
                Ok(rmp_serde::from_slice::<Value>(&bytes)?)
            }
            None => Ok(Value::Object(serde_json::Map::new())),
        }
    }

    /// Replace the document object; an empty map removes it
    pub fn set_obj(&mut self, obj: &Value) -> VellumResult<()> {
        if obj.as_object().map_or(false, |m| m.is_empty()) {
            self.erase("");
            return Ok(());
        }
        let bytes = rmp_serde::to_vec_named(obj)?;
        let locator = Locator::inline("", &bytes)?;
        self.put(locator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vellum_core::NON_STORED_SIZE_LIMIT;

    #[test]
    fn test_obj_roundtrip_through_serialise() {
        let mut data = Data::new();
        data.set_obj(&json!({"name": "x", "n": 3})).unwrap();
        data.update("text/plain", b"hello").unwrap();

        let bytes = data.serialise().unwrap();
        let back = Data::deserialise(&bytes, Some(VersionToken(4))).unwrap();
        assert_eq!(back.get_obj().unwrap(), json!({"name": "x", "n": 3}));
        assert_eq!(back.get("text/plain").unwrap().content().unwrap(), b"hello".to_vec());
        assert_eq!(back.version(), Some(VersionToken(4)));
    }

    #[test]
    fn test_empty_envelope_serialises_to_nothing() {
        let data = Data::new();
        assert!(data.serialise().unwrap().is_empty());
        assert!(Data::deserialise(&[], None).unwrap().is_empty());
        assert_eq!(data.get_obj().unwrap(), json!({}));
    }

    #[test]
    fn test_update_replaces_same_content_type() {
        let mut data = Data::new();
        data.update("a/b", b"1").unwrap();
        data.update("a/b", b"2").unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.erase("a/b"));
        assert!(!data.erase("a/b"));
    }

    #[test]
    fn test_inline_limit() {
        let mut data = Data::new();
        assert!(data.update("x/y", &vec![7u8; NON_STORED_SIZE_LIMIT]).is_ok());
        let err = data
            .update("x/y", &vec![7u8; NON_STORED_SIZE_LIMIT + 1])
            .unwrap_err();
        assert!(err.is_client());
    }

    #[test]
    fn test_large_blobs_are_compressed() {
        let mut data = Data::new();
        let blob = vec![b'a'; COMPRESSION_THRESHOLD * 4];
        data.update("text/plain", &blob).unwrap();
        let locator = data.get("text/plain").unwrap();
        assert_eq!(locator.placement(), Placement::InlineCompressed);
        assert!(locator.encoded().len() < blob.len());
        assert_eq!(locator.content().unwrap(), blob);
    }

    #[test]
    fn test_pending_stored_is_placed() {
        let mut data = Data::new();
        data.update_stored("image/png", None, b"pixels").unwrap();
        let location = StoredLocation {
            volume: 0,
            offset: 10,
            size: 6,
        };
        for locator in data.pending_stored_mut() {
            assert_eq!(locator.encoded(), b"pixels");
            locator.place(location);
        }
        let locator = data.get("image/png").unwrap();
        assert!(!locator.is_pending());
        assert_eq!(locator.location(), Some(location));
        assert!(locator.content().is_err());
    }

    #[test]
    fn test_placement_tags() {
        for p in [
            Placement::Inline,
            Placement::InlineCompressed,
            Placement::Stored,
            Placement::StoredCompressed,
        ] {
            assert_eq!(Placement::from_tag(p.tag()), Some(p));
        }
        assert_eq!(Placement::from_tag(9), None);
    }
}
