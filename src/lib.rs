//! Vellum - sharded document store front end
//!
//! Vellum turns JSON-like objects into indexed documents spread over a set of
//! shards. Every write goes through optimistic concurrency: the version read
//! is the version written against, and conflicting writers retry.
//!
//! # Quick Start
//!
//! ```ignore
//! use vellum::{Engine, Endpoints, Method, OpenFlags};
//! use serde_json::json;
//!
//! let engine = Engine::with_defaults();
//! let db = engine.handler(&"shard0;shard1".parse()?, OpenFlags::WRITABLE, Method::Put)?;
//!
//! db.index(Some(&json!("user-1")), None, &json!({"name": "Ann"}), true)?;
//! let obj = db.get_document("user-1")?.get_obj()?;
//! ```
//!
//! # Architecture
//!
//! | crate                | role                                              |
//! |----------------------|---------------------------------------------------|
//! | `vellum-core`        | ids, versions, endpoints, errors, patches         |
//! | `vellum-storage`     | shards, shard sets, the `DocumentStore` trait     |
//! | `vellum-concurrency` | schema cache, blocking queue, semaphore, latch    |
//! | `vellum-durability`  | payload envelope and dump codec                   |
//! | `vellum-engine`      | handler, bulk indexer, dump/restore, config       |

pub use vellum_concurrency::{FieldType, SchemaSnapshot};
pub use vellum_core::{
    fields, ConflictKind, Endpoint, Endpoints, InternalId, Method, OpenFlags, StoredLocation,
    TermId, VellumError, VellumResult, VersionToken, NON_STORED_SIZE_LIMIT,
};
pub use vellum_durability::{Data, DigestCheck, DumpKind, Locator, Placement};
pub use vellum_engine::*;
pub use vellum_storage::{DocumentStore, NativeDocument, ShardSet, StoreStats};
