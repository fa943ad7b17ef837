//! Dump stream codec
//!
//! ## Stream Format
//!
//! ```text
//! [header: framed][endpoints: framed][payload...][digest: length]
//! framed := [length][bytes]
//! ```
//!
//! - **header**: one of `vellum-dump-meta`, `vellum-dump-schm`,
//!   `vellum-dump-docs`
//! - **payload**: kind specific sequence of framed strings and single bytes
//! - **digest**: xxh32 (seed 0) over the *content* of every framed string and
//!   byte written, header included; length prefixes are not hashed
//!
//! ## Length Encoding
//!
//! Lengths below 255 take one byte. Anything else is `0xff` followed by
//! `length - 255` in little-endian groups of seven bits; the high bit marks
//! the last group.

use std::io::{Read, Write};
use vellum_core::{VellumError, VellumResult};
use xxhash_rust::xxh32::Xxh32;

/// Header of a metadata dump
pub const DUMP_METADATA_HEADER: &str = "vellum-dump-meta";
/// Header of a schema dump
pub const DUMP_SCHEMA_HEADER: &str = "vellum-dump-schm";
/// Header of a document dump
pub const DUMP_DOCUMENTS_HEADER: &str = "vellum-dump-docs";

/// Seed of the running digest
const DIGEST_SEED: u32 = 0;

/// What a dump stream contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    /// Metadata key/value pairs
    Metadata,
    /// One serialized schema
    Schema,
    /// Document payload fragments
    Documents,
}

impl DumpKind {
    /// Header literal opening a dump of this kind
    pub fn header(&self) -> &'static str {
        match self {
            DumpKind::Metadata => DUMP_METADATA_HEADER,
            DumpKind::Schema => DUMP_SCHEMA_HEADER,
            DumpKind::Documents => DUMP_DOCUMENTS_HEADER,
        }
    }

    /// Kind named by a header literal
    pub fn from_header(header: &[u8]) -> Option<Self> {
        [DumpKind::Metadata, DumpKind::Schema, DumpKind::Documents]
            .into_iter()
            .find(|k| k.header().as_bytes() == header)
    }
}

/// Append the length encoding of `len` to `out`
pub fn encode_length(len: u64, out: &mut Vec<u8>) {
    if len < 0xff {
        out.push(len as u8);
        return;
    }
    out.push(0xff);
    let mut rest = len - 0xff;
    loop {
        let group = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest == 0 {
            out.push(group | 0x80);
            return;
        }
        out.push(group);
    }
}

/// Read one length from `reader`
pub fn decode_length<R: Read>(reader: &mut R) -> VellumResult<u64> {
    let first = read_byte(reader)?;
    if first != 0xff {
        return Ok(u64::from(first));
    }
    let mut len: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = read_byte(reader)?;
        if shift > 63 {
            return Err(VellumError::corruption("Bad encoded length: overflow"));
        }
        len |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 != 0 {
            break;
        }
        shift += 7;
    }
    len.checked_add(0xff)
        .ok_or_else(|| VellumError::corruption("Bad encoded length: overflow"))
}

fn read_byte<R: Read>(reader: &mut R) -> VellumResult<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

// ============================================================================
// Writer
// ============================================================================

/// Streaming dump writer with a running digest
pub struct DumpWriter<W: Write> {
    inner: W,
    hasher: Xxh32,
    written: u64,
}

impl<W: Write> DumpWriter<W> {
    /// Wrap `inner`
    pub fn new(inner: W) -> Self {
        DumpWriter {
            inner,
            hasher: Xxh32::new(DIGEST_SEED),
            written: 0,
        }
    }

    /// Write the header literal and endpoint description
    pub fn write_header(&mut self, kind: DumpKind, endpoints: &str) -> VellumResult<()> {
        self.write_string(kind.header().as_bytes())?;
        self.write_string(endpoints.as_bytes())
    }

    /// Write one framed string
    pub fn write_string(&mut self, bytes: &[u8]) -> VellumResult<()> {
        let mut prefix = Vec::with_capacity(10);
        encode_length(bytes.len() as u64, &mut prefix);
        self.inner.write_all(&prefix)?;
        self.inner.write_all(bytes)?;
        self.hasher.update(bytes);
        self.written += (prefix.len() + bytes.len()) as u64;
        Ok(())
    }

    /// Write one unframed byte
    pub fn write_char(&mut self, byte: u8) -> VellumResult<()> {
        self.inner.write_all(&[byte])?;
        self.hasher.update(&[byte]);
        self.written += 1;
        Ok(())
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append the digest and flush; returns the sink and the digest
    pub fn finish(mut self) -> VellumResult<(W, u32)> {
        let digest = self.hasher.digest();
        let mut trailer = Vec::with_capacity(10);
        encode_length(u64::from(digest), &mut trailer);
        self.inner.write_all(&trailer)?;
        self.inner.flush()?;
        Ok((self.inner, digest))
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Saved and recomputed digests of a dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestCheck {
    /// Digest stored at the end of the stream; 0 if it was never reached
    pub saved: u32,
    /// Digest of what was actually read
    pub computed: u32,
    /// False if reading stopped before the trailing digest
    pub complete: bool,
}

impl DigestCheck {
    /// True if the stream was read to the end and matches its digest
    pub fn is_valid(&self) -> bool {
        self.complete && self.saved == self.computed
    }
}

/// Streaming dump reader with a running digest
pub struct DumpReader<R: Read> {
    inner: R,
    hasher: Xxh32,
    read: u64,
}

impl<R: Read> DumpReader<R> {
    /// Wrap `inner`
    pub fn new(inner: R) -> Self {
        DumpReader {
            inner,
            hasher: Xxh32::new(DIGEST_SEED),
            read: 0,
        }
    }

    /// Read the header literal and endpoint description
    ///
    /// # Errors
    ///
    /// Client error if the header is not a known dump header.
    pub fn read_header(&mut self) -> VellumResult<(DumpKind, String)> {
        let header = self.read_string()?;
        let kind = DumpKind::from_header(&header)
            .ok_or_else(|| VellumError::client("Invalid dump"))?;
        let endpoints = self.read_string()?;
        Ok((kind, String::from_utf8_lossy(&endpoints).into_owned()))
    }

    /// Read one framed string
    pub fn read_string(&mut self) -> VellumResult<Vec<u8>> {
        let len = decode_length(&mut self.inner)?;
        let mut bytes = Vec::new();
        (&mut self.inner).take(len).read_to_end(&mut bytes)?;
        if bytes.len() as u64 != len {
            return Err(VellumError::corruption(format!(
                "Truncated dump: expected {} bytes, got {}",
                len,
                bytes.len()
            )));
        }
        self.hasher.update(&bytes);
        self.read += len;
        Ok(bytes)
    }

    /// Read one unframed byte
    pub fn read_char(&mut self) -> VellumResult<u8> {
        let byte = read_byte(&mut self.inner)?;
        self.hasher.update(&[byte]);
        self.read += 1;
        Ok(byte)
    }

    /// Content bytes consumed so far
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Read the trailing digest and compare it with the running one
    pub fn finish(mut self) -> VellumResult<DigestCheck> {
        let computed = self.hasher.digest();
        let saved = decode_length(&mut self.inner)?;
        Ok(DigestCheck {
            saved: saved as u32,
            computed,
            complete: true,
        })
    }

    /// Stop reading a stream whose framing can no longer be trusted
    ///
    /// The trailing digest is not read; the check is never valid.
    pub fn abandon(self) -> DigestCheck {
        DigestCheck {
            saved: 0,
            computed: self.hasher.digest(),
            complete: false,
        }
    }
}
