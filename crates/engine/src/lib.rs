//! Document write pipeline for vellum
//!
//! This crate ties the lower layers into the write path:
//! - Engine: process-wide context (shards, schemas, scripts, preparer pool)
//! - DatabaseHandler: single-document index/patch/update with optimistic
//!   concurrency, schema publishing, metadata and document APIs
//! - DocIndexer: parallel bulk indexing with ordered results
//! - Dump/restore of metadata, schema and documents
//! - Document: retrying read accessor
//!
//! Only the handler knows how schema, versions and payload envelopes fit
//! together; the storage layer below it sees plain documents and terms.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod document;
pub mod dump;
pub mod engine;
pub mod handler;
pub mod indexer;
pub mod scheduler;
pub mod script;

pub use config::{VellumConfig, CONFIG_FILE_NAME};
pub use document::Document;
pub use dump::RestoreReport;
pub use engine::{Engine, EngineMetrics};
pub use handler::{Body, DatabaseHandler, PreparedWrite, Written, MSGPACK_CONTENT_TYPE, OCTET_STREAM};
pub use indexer::{DocIndexer, DocPreparer};
pub use scheduler::{BackpressureError, PoolStats, Task, WorkerPool};
pub use script::{NoopHook, Script, ScriptHook, ScriptRegistry, OBJECT_CONTENT_TYPE};
