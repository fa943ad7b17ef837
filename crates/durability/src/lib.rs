//! Durability layer for vellum
//!
//! This crate owns the byte formats that outlive a process:
//! - Data envelope: a document's payload fragments and their placement
//! - Dump codec: framed strings with a running xxh32 digest, used by
//!   metadata, schema and document dumps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dump;
pub mod envelope;

pub use dump::{
    decode_length, encode_length, DigestCheck, DumpKind, DumpReader, DumpWriter,
    DUMP_DOCUMENTS_HEADER, DUMP_METADATA_HEADER, DUMP_SCHEMA_HEADER,
};
pub use envelope::{Data, Locator, Placement, COMPRESSION_LEVEL, COMPRESSION_THRESHOLD};
