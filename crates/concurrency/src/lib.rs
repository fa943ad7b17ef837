//! Concurrency layer for vellum
//!
//! This crate implements the shared-state coordination of the write path:
//! - Schema / SchemaSnapshot: copy-on-write schema views and indexing
//! - SchemaStore: process-wide schema cache with compare-and-swap publish
//! - Semaphore / Latch: bulk throttle and completion signal
//! - BlockingQueue: bounded hand-off between preparers and the consumer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod queue;
pub mod schema;
pub mod schema_store;
pub mod semaphore;

pub use queue::BlockingQueue;
pub use schema::{document_id_of, FieldSpec, FieldType, IndexedDocument, Schema, SchemaSnapshot};
pub use schema_store::SchemaStore;
pub use semaphore::{Latch, Semaphore};
