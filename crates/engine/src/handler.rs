//! Per-request database handler
//!
//! A `DatabaseHandler` is bound to one shard set, its access mode, and the
//! request verb. It owns the single-document write loops, the schema
//! compare-and-swap loop, and the metadata and document APIs. Dump and
//! restore live in [`crate::dump`].
//!
//! # Write path
//!
//! ```text
//! index / patch / update
//!   └─ retry on soft conflict (up to conflict_retries)
//!        ├─ read current Data (missing document => empty)
//!        ├─ apply the verb's transform
//!        ├─ prepare: version check, script hook, schema CAS loop, finalize
//!        └─ replace_document_term
//! ```
//!
//! # Conflicts
//!
//! - A caller-supplied version that does not match the stored one is a hard
//!   conflict and is never retried
//! - A stored version that moved between our read and our write is a soft
//!   conflict; the whole read-transform-write is repeated
//! - When the budget is spent the conflict surfaces as hard

use serde_json::{Map, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};
use vellum_concurrency::{document_id_of, FieldType, Schema};
use vellum_core::{
    apply_patch, fields, shallow_merge, Endpoints, InternalId, Method, TermId, VellumError,
    VellumResult, VersionToken,
};
use vellum_durability::{Data, Locator};
use vellum_storage::{DocumentStore, NativeDocument};

use crate::document::Document;
use crate::engine::Engine;
use crate::script::OBJECT_CONTENT_TYPE;

/// Content type of blobs injected as a bare `_data` string
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type reported for the document object itself
pub const MSGPACK_CONTENT_TYPE: &str = "application/x-msgpack";

// Response keys of the info APIs
const RESPONSE_RAW_DATA: &str = "_raw_data";
const RESPONSE_DATA: &str = "_data";
const RESPONSE_TERMS: &str = "_terms";
const RESPONSE_VALUES: &str = "_values";
const RESPONSE_CONTENT_TYPE: &str = "_content_type";
const RESPONSE_TYPE: &str = "_type";
const RESPONSE_VOLUME: &str = "_volume";
const RESPONSE_OFFSET: &str = "_offset";
const RESPONSE_SIZE: &str = "_size";
const RESPONSE_ENDPOINTS: &str = "_endpoints";
const RESPONSE_SHARDS: &str = "_shards";
const RESPONSE_REVISION: &str = "_revision";
const RESPONSE_DOC_COUNT: &str = "_doc_count";
const RESPONSE_LAST_ID: &str = "_last_id";
const RESPONSE_DOC_DEL: &str = "_doc_del";

// ============================================================================
// Request bodies and results
// ============================================================================

/// What a write carries
#[derive(Debug, Clone, Copy)]
pub enum Body<'a> {
    /// A structured object; must be a map
    Object(&'a Value),
    /// A raw blob of `content_type`
    Blob {
        /// Blob bytes
        bytes: &'a [u8],
        /// Content type of the blob
        content_type: &'a str,
        /// Keep the blob in the shard volume instead of inline
        stored: bool,
    },
    /// Remove the blob of `content_type`
    Erase {
        /// Content type to remove
        content_type: &'a str,
    },
}

impl<'a> Body<'a> {
    /// Interpret a loosely typed request body
    ///
    /// A string is a blob of `content_type`, null erases that content type,
    /// and a map is an object.
    ///
    /// # Errors
    ///
    /// Client error for any other value, or for a map that asks to be stored.
    pub fn raw(value: &'a Value, content_type: &'a str, stored: bool) -> VellumResult<Self> {
        match value {
            Value::String(s) => Ok(Body::Blob {
                bytes: s.as_bytes(),
                content_type,
                stored,
            }),
            Value::Null => Ok(Body::Erase { content_type }),
            Value::Object(_) if stored => Err(VellumError::client(
                "Objects of this type cannot be put in storage",
            )),
            Value::Object(_) => Ok(Body::Object(value)),
            other => Err(VellumError::client(format!(
                "Indexed object must be a JSON, a MsgPack or a blob, is {}",
                type_name(other)
            ))),
        }
    }
}

impl<'a> From<&'a Value> for Body<'a> {
    fn from(value: &'a Value) -> Self {
        Body::Object(value)
    }
}

/// Output of the prepare stage: everything needed to commit one document
#[derive(Debug, Clone)]
pub struct PreparedWrite {
    /// Unique term of the document
    pub term_id: TermId,
    /// Backend document, data and version attached
    pub doc: NativeDocument,
    /// Object returned to the caller
    pub obj: Value,
}

/// A committed single-document write
#[derive(Debug, Clone, PartialEq)]
pub struct Written {
    /// Internal id the document got
    pub did: InternalId,
    /// Stored object, enriched with `_id`, `_version` and diagnostics
    pub obj: Value,
}

// ============================================================================
// DatabaseHandler
// ============================================================================

/// Per-request façade over one shard set
#[derive(Clone)]
pub struct DatabaseHandler {
    engine: Arc<Engine>,
    store: Arc<dyn DocumentStore>,
    method: Method,
    content_type: String,
    comments: bool,
}

impl DatabaseHandler {
    pub(crate) fn new(engine: Arc<Engine>, store: Arc<dyn DocumentStore>, method: Method) -> Self {
        DatabaseHandler {
            engine,
            store,
            method,
            content_type: OBJECT_CONTENT_TYPE.to_string(),
            comments: false,
        }
    }

    /// Echo `_document_id` and `_shard` in write results
    pub fn with_comments(mut self, comments: bool) -> Self {
        self.comments = comments;
        self
    }

    /// Content type selecting the script hook of this request
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    /// Engine this handler belongs to
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Store this handler operates on
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Shard endpoints
    pub fn endpoints(&self) -> &Endpoints {
        self.store.endpoints()
    }

    /// Request verb
    pub fn method(&self) -> Method {
        self.method
    }

    /// True if write results carry diagnostics
    pub fn comments(&self) -> bool {
        self.comments
    }

    pub(crate) fn check_writable(&self) -> VellumResult<()> {
        if !self.store.is_writable() {
            return Err(VellumError::client(format!(
                "Database {} is read-only",
                self.endpoints()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Single-document writes
    // ========================================================================

    /// Replace the document's object and payload wholesale
    ///
    /// Without a `document_id` the object's own `_id` is used, and without
    /// that a UUID is generated.
    pub fn index<'a>(
        &self,
        document_id: Option<&Value>,
        version: Option<VersionToken>,
        body: impl Into<Body<'a>>,
        commit: bool,
    ) -> VellumResult<Written> {
        self.check_writable()?;
        let body = body.into();
        self.retry_on_conflict(version, || {
            let mut data = Data::new();
            let obj = match body {
                Body::Object(value) => {
                    inject_data(&mut data, as_map(value)?)?;
                    value.clone()
                }
                Body::Blob {
                    bytes,
                    content_type,
                    stored,
                } => {
                    put_blob(&mut data, content_type, bytes, stored)?;
                    Value::Object(Map::new())
                }
                Body::Erase { content_type } => {
                    data.erase(content_type);
                    Value::Object(Map::new())
                }
            };
            self.write(document_id, version, &obj, data, commit)
        })
    }

    /// Apply a structured patch to the stored object
    ///
    /// A missing document patches an empty object.
    ///
    /// # Errors
    ///
    /// Client error if `document_id` is absent or `patches` is neither a map
    /// nor an array.
    pub fn patch(
        &self,
        document_id: Option<&Value>,
        version: Option<VersionToken>,
        patches: &Value,
        commit: bool,
    ) -> VellumResult<Written> {
        self.check_writable()?;
        let document_id = require_id(document_id)?;
        if !patches.is_object() && !patches.is_array() {
            return Err(VellumError::client("Patches must be a JSON or MsgPack"));
        }
        let term_id = self.get_prefixed_term_id(document_id)?;
        self.retry_on_conflict(version, || {
            let data = self.read_current(&term_id)?;
            let mut obj = data.get_obj()?;
            apply_patch(patches, &mut obj)?;
            self.write(Some(document_id), version, &obj, data, commit)
        })
    }

    /// Merge the body into the stored object
    ///
    /// An empty stored object is replaced by the body; otherwise top-level
    /// keys of the body overwrite the stored ones.
    pub fn update<'a>(
        &self,
        document_id: Option<&Value>,
        version: Option<VersionToken>,
        body: impl Into<Body<'a>>,
        commit: bool,
    ) -> VellumResult<Written> {
        self.check_writable()?;
        let document_id = require_id(document_id)?;
        let body = body.into();
        let term_id = self.get_prefixed_term_id(document_id)?;
        self.retry_on_conflict(version, || {
            let mut data = self.read_current(&term_id)?;
            let current = data.get_obj()?;
            let obj = merge_body(&mut data, current, body)?;
            self.write(Some(document_id), version, &obj, data, commit)
        })
    }

    fn retry_on_conflict<T>(
        &self,
        version: Option<VersionToken>,
        mut attempt: impl FnMut() -> VellumResult<T>,
    ) -> VellumResult<T> {
        let mut left = self.engine.config().conflict_retries;
        loop {
            match attempt() {
                Err(e) if e.is_soft_conflict() => {
                    left = left.saturating_sub(1);
                    if left == 0 || version.is_some() {
                        return Err(e.into_hard());
                    }
                    self.engine
                        .counters
                        .conflict_retries
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(target: "vellum::handler", error = %e, left, "Retrying write");
                }
                result => return result,
            }
        }
    }

    fn write(
        &self,
        document_id: Option<&Value>,
        version: Option<VersionToken>,
        obj: &Value,
        data: Data,
        commit: bool,
    ) -> VellumResult<Written> {
        let prepared = self.prepare(document_id, version, obj, data)?;
        let did = self
            .store
            .replace_document_term(&prepared.term_id, prepared.doc, commit)?;
        self.engine
            .counters
            .documents_written
            .fetch_add(1, Ordering::Relaxed);
        let obj = self.enrich(did, prepared.obj);
        Ok(Written { did, obj })
    }

    /// Add `_version` and, with comments on, `_document_id` and `_shard`
    pub(crate) fn enrich(&self, did: InternalId, mut obj: Value) -> Value {
        let version = Document::new(did, Some(self.clone())).get_version();
        if let Value::Object(map) = &mut obj {
            match version {
                Ok(Some(v)) => {
                    map.insert(fields::VERSION.to_string(), Value::from(v.as_u64()));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "vellum::handler", did = %did, error = %e, "Cannot retrieve document version");
                }
            }
            if self.comments {
                map.insert(fields::DOCUMENT_ID.to_string(), Value::from(did.as_u64()));
                let shard = did.shard_index(self.endpoints().len());
                map.insert(fields::SHARD.to_string(), Value::from(shard));
            }
        }
        obj
    }

    /// Data envelope of the document indexed by `term_id`
    ///
    /// A missing document reads as an empty envelope.
    fn read_current(&self, term_id: &TermId) -> VellumResult<Data> {
        let did = match self.store.find_document(term_id) {
            Ok(did) => did,
            Err(e) if e.is_not_found() => return Ok(Data::new()),
            Err(e) => return Err(e),
        };
        match Document::new(did, Some(self.clone())).get_envelope() {
            Err(e) if e.is_not_found() => Ok(Data::new()),
            other => other,
        }
    }

    // ========================================================================
    // Prepare
    // ========================================================================

    /// Turn `obj` into a committable document
    ///
    /// Runs the script hook of the handler's content type, transforms the
    /// object with the current schema (re-running the transform until any
    /// schema change is published), then attaches the serialized `data` and
    /// the version token. Pending `stored` blobs are written to the volume
    /// of the shard the document lands on. Volume space is append-only: a
    /// write that fails or is retried after this point leaves the blobs it
    /// stored unreferenced.
    ///
    /// # Errors
    ///
    /// Hard conflict if `version` is given and differs from the version
    /// `data` was read at; client errors from the schema transform.
    pub fn prepare(
        &self,
        document_id: Option<&Value>,
        version: Option<VersionToken>,
        obj: &Value,
        mut data: Data,
    ) -> VellumResult<PreparedWrite> {
        if let (Some(expected), Some(stored)) = (version, data.version()) {
            if expected != stored {
                let label = document_id.map(Value::to_string).unwrap_or_default();
                return Err(VellumError::hard_conflict(
                    label,
                    format!("Version mismatch! expected {}, stored {}", expected, stored),
                ));
            }
        }

        let map = as_map(obj)?;
        let document_id = document_id
            .filter(|id| !id.is_null())
            .cloned()
            .or_else(|| document_id_of(map));

        let script = self.engine.scripts().script_for(&self.content_type);
        let scripted;
        let map = if script.is_noop() {
            map
        } else {
            let old = match (data.version(), document_id.as_ref()) {
                (Some(_), _) => data.get_obj()?,
                (None, Some(id)) => {
                    let current = self.read_current(&self.get_prefixed_term_id(id)?)?;
                    data.set_version(current.version());
                    current.get_obj()?
                }
                (None, None) => Value::Object(Map::new()),
            };
            debug!(target: "vellum::handler", method = %self.method, "Running script");
            scripted = script.run(self.method, obj.clone(), &old)?;
            as_map(&scripted)?
        };

        let indexed = loop {
            let mut schema = Schema::new(self.engine.schemas().get(self.endpoints()));
            let indexed = schema.index(map, document_id.as_ref())?;
            if self.update_schema(&mut schema) {
                break indexed;
            }
        };

        let mut doc = indexed.doc;
        data.set_obj(&indexed.obj)?;
        for locator in data.pending_stored_mut() {
            let location = self.store.store_blob(&indexed.term_id, locator.encoded())?;
            locator.place(location);
        }
        let serialised = data.serialise()?;
        if !serialised.is_empty() {
            doc.set_data(serialised);
        }
        if let Some(v) = version.or(data.version()) {
            doc.set_version(v);
        }

        debug!(target: "vellum::handler", term_id = %indexed.term_id, "Prepared document");
        Ok(PreparedWrite {
            term_id: indexed.term_id,
            doc,
            obj: indexed.obj,
        })
    }

    /// Prepare one bulk object, selecting the verb from its `_op_type`
    ///
    /// `index` (the default) replaces, `patch` applies the object as a merge
    /// patch, `update` and `merge` merge it into the stored object.
    pub fn prepare_document(&self, body: Value) -> VellumResult<PreparedWrite> {
        self.check_writable()?;
        let Value::Object(mut map) = body else {
            return Err(VellumError::client("Object must be a JSON or MsgPack"));
        };
        let document_id = document_id_of(&map);
        let op_type = match map.remove(fields::OP_TYPE) {
            None => "index".to_string(),
            Some(Value::String(op)) => op,
            Some(other) => {
                return Err(VellumError::client(format!(
                    "Invalid operation type: {}",
                    other
                )))
            }
        };
        let body = Value::Object(map);

        match op_type.as_str() {
            "index" => {
                let mut data = Data::new();
                inject_data(&mut data, as_map(&body)?)?;
                self.prepare(document_id.as_ref(), None, &body, data)
            }
            "patch" => {
                let id = require_id(document_id.as_ref())?;
                let data = self.read_current(&self.get_prefixed_term_id(id)?)?;
                let mut obj = data.get_obj()?;
                apply_patch(&body, &mut obj)?;
                self.prepare(Some(id), None, &obj, data)
            }
            "update" | "merge" => {
                let id = require_id(document_id.as_ref())?;
                let mut data = self.read_current(&self.get_prefixed_term_id(id)?)?;
                let current = data.get_obj()?;
                let obj = merge_body(&mut data, current, Body::Object(&body))?;
                self.prepare(Some(id), None, &obj, data)
            }
            other => Err(VellumError::client(format!(
                "Invalid operation type: {:?}",
                other
            ))),
        }
    }

    // ========================================================================
    // Schema
    // ========================================================================

    /// Publish the schema's modifications, if any
    ///
    /// Returns false if another writer published first; the caller must
    /// refetch the schema and redo its transform.
    fn update_schema(&self, schema: &mut Schema) -> bool {
        let Some(modified) = schema.take_modified() else {
            return true;
        };
        if modified.same_definition(schema.base()) {
            return true;
        }
        let created = schema.base().id_type.is_none() && schema.base().fields.is_empty();
        if !self
            .engine
            .schemas()
            .set(self.endpoints(), schema.base(), modified)
        {
            return false;
        }
        self.engine
            .counters
            .schema_publishes
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "vellum::handler",
            endpoints = %self.endpoints(),
            "Schema {}",
            if created { "created" } else { "updated" }
        );
        true
    }

    /// Unique term for an external id under the current schema
    pub fn get_prefixed_term_id(&self, document_id: &Value) -> VellumResult<TermId> {
        Schema::new(self.engine.schemas().get(self.endpoints())).get_prefixed_term_id(document_id)
    }

    /// Apply a schema definition; `replace` starts from an empty schema
    pub fn write_schema(&self, obj: &Value, replace: bool) -> VellumResult<()> {
        loop {
            let mut schema = Schema::new(self.engine.schemas().get(self.endpoints()));
            schema.write(obj, replace)?;
            if self.update_schema(&mut schema) {
                return Ok(());
            }
        }
    }

    /// Reset the schema to empty
    pub fn delete_schema(&self) {
        loop {
            let base = self.engine.schemas().get(self.endpoints());
            if self.engine.schemas().drop_schema(self.endpoints(), &base) {
                debug!(target: "vellum::handler", endpoints = %self.endpoints(), "Schema deleted");
                return;
            }
        }
    }

    /// Current schema definition
    pub fn get_schema(&self) -> Value {
        self.engine.schemas().get(self.endpoints()).to_value()
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// All metadata keys
    pub fn get_metadata_keys(&self) -> VellumResult<Vec<String>> {
        self.store.metadata_keys()
    }

    /// Metadata value; empty when unset
    pub fn get_metadata(&self, key: &str) -> VellumResult<Vec<u8>> {
        self.store.get_metadata(key)
    }

    /// Set metadata `key`
    ///
    /// Without `overwrite` an existing value is kept, and the return value
    /// says whether it equals `value`.
    pub fn set_metadata(
        &self,
        key: &str,
        value: &[u8],
        commit: bool,
        overwrite: bool,
    ) -> VellumResult<bool> {
        if !overwrite {
            let old = self.store.get_metadata(key)?;
            if !old.is_empty() {
                return Ok(old == value);
            }
        }
        self.store.set_metadata(key, value, commit)?;
        Ok(true)
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Term for an id given as text, cast to the schema's id type
    fn term_for(&self, document_id: &str) -> VellumResult<TermId> {
        let schema = self.engine.schemas().get(self.endpoints());
        let id = match schema.id_type {
            Some(FieldType::Integer | FieldType::Float | FieldType::Boolean) => {
                serde_json::from_str::<Value>(document_id).map_err(|e| {
                    VellumError::client(format!(
                        "Value {:?} cannot be cast to {} [{}]",
                        document_id,
                        schema.id_type.map_or("", |t| t.name()),
                        e
                    ))
                })?
            }
            _ => Value::String(document_id.to_string()),
        };
        self.get_prefixed_term_id(&id)
    }

    fn literal_id(document_id: &str) -> VellumResult<Option<InternalId>> {
        InternalId::parse_literal(document_id).map_err(VellumError::client)
    }

    /// Document addressed by external id or by a `::<n>` internal id
    pub fn get_document(&self, document_id: &str) -> VellumResult<Document> {
        let did = self.get_docid(document_id)?;
        Ok(Document::new(did, Some(self.clone())))
    }

    /// Document with internal id `did`
    pub fn get_document_by_docid(&self, did: InternalId) -> Document {
        Document::new(did, Some(self.clone()))
    }

    /// Internal id of a document addressed by external or internal id
    pub fn get_docid(&self, document_id: &str) -> VellumResult<InternalId> {
        if let Some(did) = Self::literal_id(document_id)? {
            return Ok(did);
        }
        let term_id = self.term_for(document_id)?;
        self.store.find_document(&term_id)
    }

    /// Delete a document addressed by external or internal id
    pub fn delete_document(&self, document_id: &str, commit: bool) -> VellumResult<()> {
        self.check_writable()?;
        if let Some(did) = Self::literal_id(document_id)? {
            return self.store.delete_document(did, commit);
        }
        let term_id = self.term_for(document_id)?;
        self.delete_document_term(&term_id, commit)
    }

    /// Delete the document indexed by `term`
    pub fn delete_document_term(&self, term: &TermId, commit: bool) -> VellumResult<()> {
        self.check_writable()?;
        self.store.delete_document_term(term, commit)
    }

    /// Store `doc` under internal id `did`
    pub fn replace_document(
        &self,
        did: InternalId,
        doc: NativeDocument,
        commit: bool,
    ) -> VellumResult<InternalId> {
        self.check_writable()?;
        self.store.replace_document(did, doc, commit)
    }

    /// Store `doc` as the document indexed by `term`
    pub fn replace_document_term(
        &self,
        term: &TermId,
        doc: NativeDocument,
        commit: bool,
    ) -> VellumResult<InternalId> {
        self.check_writable()?;
        let did = self.store.replace_document_term(term, doc, commit)?;
        self.engine
            .counters
            .documents_written
            .fetch_add(1, Ordering::Relaxed);
        Ok(did)
    }

    /// Internal view of a document: id, payload locators, terms, values
    pub fn get_document_info(&self, document_id: &str, raw_data: bool) -> VellumResult<Value> {
        let document = self.get_document(document_id)?;
        let data = document.get_envelope()?;

        let mut info = Map::new();
        info.insert(
            fields::DOCUMENT_ID.to_string(),
            Value::from(document.get_docid().as_u64()),
        );
        if raw_data {
            info.insert(RESPONSE_RAW_DATA.to_string(), serde_json::to_value(&data)?);
        }
        info.insert(
            RESPONSE_DATA.to_string(),
            Value::Array(data.iter().map(locator_info).collect()),
        );
        info.insert(RESPONSE_TERMS.to_string(), document.get_terms(self.read_retries())?);
        info.insert(RESPONSE_VALUES.to_string(), document.get_values(self.read_retries())?);
        Ok(Value::Object(info))
    }

    /// Counts and revision of the shard set
    pub fn get_database_info(&self) -> VellumResult<Value> {
        let stats = self.store.stats()?;
        let mut info = Map::new();
        info.insert(
            RESPONSE_ENDPOINTS.to_string(),
            Value::String(self.endpoints().to_string()),
        );
        info.insert(RESPONSE_SHARDS.to_string(), Value::from(self.endpoints().len()));
        info.insert(RESPONSE_REVISION.to_string(), Value::from(stats.revision));
        info.insert(RESPONSE_DOC_COUNT.to_string(), Value::from(stats.doc_count));
        info.insert(RESPONSE_LAST_ID.to_string(), Value::from(stats.last_docid));
        info.insert(
            RESPONSE_DOC_DEL.to_string(),
            Value::from(stats.last_docid.saturating_sub(stats.doc_count)),
        );
        Ok(Value::Object(info))
    }

    /// Content of a `stored` fragment of document `did`
    pub fn storage_get_stored(&self, locator: &Locator, did: InternalId) -> VellumResult<Vec<u8>> {
        let location = locator.location().ok_or_else(|| {
            VellumError::client(format!(
                "Fragment {:?} is not in storage",
                locator.content_type()
            ))
        })?;
        let encoded = self.store.get_stored(did, location)?;
        locator.decode(&encoded)
    }

    /// Commit pending changes
    pub fn commit(&self, flush_wal: bool) -> VellumResult<bool> {
        self.store.commit(flush_wal)
    }

    /// Move read-only views to the latest commit
    pub fn reopen(&self) -> VellumResult<bool> {
        self.store.reopen()
    }

    pub(crate) fn read_retries(&self) -> usize {
        self.engine.config().read_retries
    }
}

impl std::fmt::Debug for DatabaseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandler")
            .field("endpoints", &self.endpoints().to_string())
            .field("writable", &self.store.is_writable())
            .field("method", &self.method)
            .finish()
    }
}

// ============================================================================
// Body helpers
// ============================================================================

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

fn as_map(value: &Value) -> VellumResult<&Map<String, Value>> {
    value.as_object().ok_or_else(|| {
        VellumError::client(format!(
            "Indexed object must be a JSON, a MsgPack or a blob, is {}",
            type_name(value)
        ))
    })
}

fn require_id(document_id: Option<&Value>) -> VellumResult<&Value> {
    document_id
        .filter(|id| !id.is_null())
        .ok_or_else(|| VellumError::client("Document must have an 'id'"))
}

fn put_blob(data: &mut Data, content_type: &str, bytes: &[u8], stored: bool) -> VellumResult<()> {
    if stored {
        data.update_stored(content_type, None, bytes)
    } else {
        data.update(content_type, bytes)
    }
}

/// Fold an update body into the stored object `obj`
fn merge_body(data: &mut Data, mut obj: Value, body: Body<'_>) -> VellumResult<Value> {
    match body {
        Body::Blob {
            bytes,
            content_type,
            stored,
        } => put_blob(data, content_type, bytes, stored)?,
        Body::Erase { content_type } => {
            data.erase(content_type);
        }
        Body::Object(value) => {
            let incoming = as_map(value)?;
            if obj.as_object().map_or(true, Map::is_empty) {
                inject_data(data, incoming)?;
                return Ok(value.clone());
            }
            shallow_merge(&mut obj, incoming);
            inject_data(data, as_map(&obj)?)?;
        }
    }
    Ok(obj)
}

/// Apply the reserved `_data` field of `obj` to `data`
///
/// - string: inline `application/octet-stream` blob
/// - null: erase that blob
/// - map: one `{ _blob, _content_type, _type }` entry
/// - array: several entries
fn inject_data(data: &mut Data, obj: &Map<String, Value>) -> VellumResult<()> {
    match obj.get(fields::DATA) {
        None => Ok(()),
        Some(Value::String(blob)) => data.update(OCTET_STREAM, blob.as_bytes()),
        Some(Value::Null) => {
            data.erase(OCTET_STREAM);
            Ok(())
        }
        Some(Value::Object(entry)) => inject_blob(data, entry),
        Some(Value::Array(entries)) => {
            for entry in entries {
                let entry = entry.as_object().ok_or_else(|| {
                    VellumError::client(format!(
                        "Data inconsistency, objects in '{}' must contain '{}'",
                        fields::DATA,
                        fields::BLOB
                    ))
                })?;
                inject_blob(data, entry)?;
            }
            Ok(())
        }
        Some(_) => Err(VellumError::client(format!(
            "Data inconsistency, '{}' must be an array or an object",
            fields::DATA
        ))),
    }
}

fn inject_blob(data: &mut Data, entry: &Map<String, Value>) -> VellumResult<()> {
    let blob = match entry.get(fields::BLOB) {
        Some(Value::String(blob)) => blob,
        Some(_) => {
            return Err(VellumError::client(format!(
                "Data inconsistency, '{}' must be a string",
                fields::BLOB
            )))
        }
        None => {
            return Err(VellumError::client(format!(
                "Data inconsistency, objects in '{}' must contain '{}'",
                fields::DATA,
                fields::BLOB
            )))
        }
    };
    let content_type = match entry.get(fields::CONTENT_TYPE) {
        Some(Value::String(ct)) if !ct.is_empty() => ct,
        Some(_) => {
            return Err(VellumError::client(format!(
                "Data inconsistency, '{}' must be a valid content type string",
                fields::CONTENT_TYPE
            )))
        }
        None => {
            return Err(VellumError::client(format!(
                "Data inconsistency, objects in '{}' must contain '{}'",
                fields::DATA,
                fields::CONTENT_TYPE
            )))
        }
    };
    match entry.get(fields::TYPE).map(Value::as_str) {
        None | Some(Some("inplace")) => data.update(content_type, blob.as_bytes()),
        Some(Some("stored")) => data.update_stored(content_type, None, blob.as_bytes()),
        Some(_) => Err(VellumError::client(format!(
            "Data inconsistency, '{}' must be either \"inplace\" or \"stored\"",
            fields::TYPE
        ))),
    }
}

fn locator_info(locator: &Locator) -> Value {
    let mut info = Map::new();
    let content_type = if locator.content_type().is_empty() {
        MSGPACK_CONTENT_TYPE
    } else {
        locator.content_type()
    };
    info.insert(
        RESPONSE_CONTENT_TYPE.to_string(),
        Value::String(content_type.to_string()),
    );
    if locator.placement().is_stored() {
        info.insert(RESPONSE_TYPE.to_string(), Value::String("stored".to_string()));
        if let Some(location) = locator.location() {
            info.insert(RESPONSE_VOLUME.to_string(), Value::from(location.volume));
            info.insert(RESPONSE_OFFSET.to_string(), Value::from(location.offset));
            info.insert(RESPONSE_SIZE.to_string(), Value::from(location.size));
        }
    } else {
        info.insert(RESPONSE_TYPE.to_string(), Value::String("inplace".to_string()));
    }
    Value::Object(info)
}
