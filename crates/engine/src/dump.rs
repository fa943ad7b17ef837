//! Dump and restore of metadata, schema and documents
//!
//! Each dump is one stream: header, source endpoints, payload, xxh32 digest.
//!
//! | kind      | payload                                                   |
//! |-----------|-----------------------------------------------------------|
//! | metadata  | `(key, value)*` then `("", "")`                           |
//! | schema    | one msgpack schema definition (empty for no schema)       |
//! | documents | per document `(blob, content_type, placement)*` then `""`,|
//! |           | then a final `""`; the object has an empty content type   |
//!
//! Document restore feeds a dedicated preparer pool and a single committing
//! consumer, throttled the same way as bulk indexing. A digest mismatch is
//! reported, not fatal: everything read is already applied. A document record
//! that cannot be decoded ends the read; the documents before it are still
//! applied and the digest check is reported incomplete.

use serde_json::{Map, Value};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vellum_concurrency::{document_id_of, BlockingQueue, Semaphore};
use vellum_core::{VellumError, VellumResult};
use vellum_durability::{Data, DigestCheck, DumpKind, DumpReader, DumpWriter, Placement};

use crate::handler::{DatabaseHandler, PreparedWrite};
use crate::scheduler::{Task, WorkerPool};

/// Outcome of a restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// What the stream contained
    pub kind: DumpKind,
    /// Endpoints the dump was taken from
    pub source: String,
    /// Metadata keys, schemas or documents applied
    pub restored: usize,
    /// Entries skipped as unusable
    pub skipped: usize,
    /// Saved and recomputed digests
    pub digest: DigestCheck,
}

fn corrupt_utf8(what: &str, e: std::string::FromUtf8Error) -> VellumError {
    VellumError::corruption(format!("Invalid {} in dump: {}", what, e))
}

// ============================================================================
// Dump
// ============================================================================

impl DatabaseHandler {
    /// Write every metadata key and value to `out`; returns the digest
    pub fn dump_metadata<W: Write>(&self, out: W) -> VellumResult<u32> {
        let mut writer = DumpWriter::new(out);
        writer.write_header(DumpKind::Metadata, &self.endpoints().to_string())?;
        let mut count = 0usize;
        for key in self.get_metadata_keys()? {
            if key.is_empty() {
                continue;
            }
            let value = self.get_metadata(&key)?;
            writer.write_string(key.as_bytes())?;
            writer.write_string(&value)?;
            count += 1;
        }
        writer.write_string(b"")?;
        writer.write_string(b"")?;
        let (_, digest) = writer.finish()?;
        debug!(target: "vellum::dump", endpoints = %self.endpoints(), count, "Dumped metadata");
        Ok(digest)
    }

    /// Write the schema definition to `out`; returns the digest
    pub fn dump_schema<W: Write>(&self, out: W) -> VellumResult<u32> {
        let mut writer = DumpWriter::new(out);
        writer.write_header(DumpKind::Schema, &self.endpoints().to_string())?;
        let schema = self.get_schema();
        let blob = match schema.as_object() {
            Some(map) if !map.is_empty() => rmp_serde::to_vec_named(&schema)?,
            _ => Vec::new(),
        };
        writer.write_string(&blob)?;
        let (_, digest) = writer.finish()?;
        debug!(target: "vellum::dump", endpoints = %self.endpoints(), "Dumped schema");
        Ok(digest)
    }

    /// Write every document's payload fragments to `out`; returns the digest
    ///
    /// `stored` fragments are read back from the shard volumes, so the dump
    /// is self-contained.
    pub fn dump_documents<W: Write>(&self, out: W) -> VellumResult<u32> {
        let mut writer = DumpWriter::new(out);
        writer.write_header(DumpKind::Documents, &self.endpoints().to_string())?;
        let mut count = 0usize;
        for (did, doc) in self.store().export_documents()? {
            let data = Data::deserialise(doc.data(), doc.version())?;
            if data.is_empty() {
                warn!(target: "vellum::dump", did = %did, "Skipping document without data");
                continue;
            }
            for locator in data.iter() {
                let content = if locator.placement().is_stored() {
                    self.storage_get_stored(locator, did)?
                } else {
                    locator.content()?
                };
                writer.write_string(&content)?;
                writer.write_string(locator.content_type().as_bytes())?;
                writer.write_char(locator.placement().tag())?;
            }
            writer.write_string(b"")?;
            count += 1;
        }
        writer.write_string(b"")?;
        let (_, digest) = writer.finish()?;
        info!(target: "vellum::dump", endpoints = %self.endpoints(), count, "Dumped documents");
        Ok(digest)
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// Apply a dump of any kind read from `input`
    ///
    /// # Errors
    ///
    /// Client error for an unknown header or a read-only handler. Metadata
    /// and schema read errors abort the restore; unreadable document records
    /// only stop it early.
    pub fn restore<R: Read>(&self, input: R) -> VellumResult<RestoreReport> {
        self.check_writable()?;
        let mut reader = DumpReader::new(input);
        let (kind, source) = reader.read_header()?;
        info!(
            target: "vellum::dump",
            kind = ?kind,
            source = %source,
            endpoints = %self.endpoints(),
            "Restoring dump"
        );

        let (restored, skipped, intact) = match kind {
            DumpKind::Metadata => {
                let (restored, skipped) = self.restore_metadata(&mut reader)?;
                (restored, skipped, true)
            }
            DumpKind::Schema => {
                let (restored, skipped) = self.restore_schema(&mut reader)?;
                (restored, skipped, true)
            }
            DumpKind::Documents => self.restore_documents(&mut reader)?,
        };

        let digest = if intact {
            reader.finish()?
        } else {
            reader.abandon()
        };
        if !digest.complete {
            warn!(
                target: "vellum::dump",
                "Invalid dump hash. Stream ended early, hash of what was read is {:#010x}",
                digest.computed
            );
        } else if !digest.is_valid() {
            warn!(
                target: "vellum::dump",
                "Invalid dump hash. Should be {:#010x}, but instead is {:#010x}",
                digest.saved,
                digest.computed
            );
        }
        info!(target: "vellum::dump", kind = ?kind, restored, skipped, "Restore done");
        Ok(RestoreReport {
            kind,
            source,
            restored,
            skipped,
            digest,
        })
    }

    fn restore_metadata<R: Read>(&self, reader: &mut DumpReader<R>) -> VellumResult<(usize, usize)> {
        let mut restored = 0;
        let mut skipped = 0;
        loop {
            let key = reader.read_string()?;
            let value = reader.read_string()?;
            if key.is_empty() {
                if value.is_empty() {
                    break;
                }
                warn!(target: "vellum::dump", "Metadata with no key ignored");
                skipped += 1;
                continue;
            }
            let key = String::from_utf8(key).map_err(|e| corrupt_utf8("metadata key", e))?;
            self.store().set_metadata(&key, &value, false)?;
            restored += 1;
        }
        self.commit(false)?;
        Ok((restored, skipped))
    }

    fn restore_schema<R: Read>(&self, reader: &mut DumpReader<R>) -> VellumResult<(usize, usize)> {
        let blob = reader.read_string()?;
        if blob.is_empty() {
            return Ok((0, 0));
        }
        let schema: Value = rmp_serde::from_slice(&blob)?;
        self.write_schema(&schema, true)?;
        Ok((1, 0))
    }

    /// Returns restored and skipped counts, and whether the stream was read
    /// to its end marker
    fn restore_documents<R: Read>(
        &self,
        reader: &mut DumpReader<R>,
    ) -> VellumResult<(usize, usize, bool)> {
        let config = self.engine().config();
        let pool = WorkerPool::new(
            "vellum-restore",
            config.restore_threads(),
            config.preparer_queue_depth,
        );
        let job = Arc::new(RestoreJob {
            handler: self.clone(),
            queue: BlockingQueue::new(config.preparer_queue_depth),
            total: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
            throttle: Semaphore::new(config.throttle_limit),
        });

        let consumer_job = Arc::clone(&job);
        let consumer = std::thread::Builder::new()
            .name("vellum-restore-commit".to_string())
            .spawn(move || consumer_job.consume())
            .expect("failed to spawn restore thread");

        let mut skipped = 0;
        let intact = job.produce(reader, &pool, &mut skipped);
        job.ready.store(true, Ordering::Release);
        let joined = consumer.join();
        pool.shutdown();
        self.commit(false)?;

        if joined.is_err() {
            return Err(VellumError::internal("Restore consumer panicked"));
        }
        Ok((job.written.load(Ordering::Acquire), skipped, intact))
    }
}

// ============================================================================
// Document restore pipeline
// ============================================================================

struct RestoreJob {
    handler: DatabaseHandler,
    queue: BlockingQueue<Option<PreparedWrite>>,
    total: AtomicUsize,
    processed: AtomicUsize,
    written: AtomicUsize,
    ready: AtomicBool,
    throttle: Semaphore,
}

impl RestoreJob {
    /// Read documents and feed them to `pool` until the end marker
    ///
    /// Stops at the first record that cannot be read and returns false;
    /// the pending batch is submitted either way.
    fn produce<R: Read>(
        self: &Arc<Self>,
        reader: &mut DumpReader<R>,
        pool: &WorkerPool,
        skipped: &mut usize,
    ) -> bool {
        let batch_size = self.handler.engine().config().bulk_batch_size;
        let mut batch: Vec<Task> = Vec::with_capacity(batch_size);
        let mut intact = true;
        loop {
            let (obj, data) = match read_document(reader) {
                Ok(Some(document)) => document,
                Ok(None) => break,
                Err(e) => {
                    error!(target: "vellum::dump", error = %e, "Cannot replace document, stopping restore");
                    *skipped += 1;
                    intact = false;
                    break;
                }
            };
            let Some(id) = obj.as_object().and_then(document_id_of) else {
                warn!(target: "vellum::dump", "Skipping document without id");
                *skipped += 1;
                continue;
            };
            let job = Arc::clone(self);
            batch.push(Box::new(move || job.prepare(id, obj, data)));
            if batch.len() >= batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                if self.submit(pool, full, skipped) {
                    self.throttle();
                }
            }
        }
        if !batch.is_empty() {
            self.submit(pool, batch, skipped);
        }
        intact
    }

    fn submit(&self, pool: &WorkerPool, batch: Vec<Task>, skipped: &mut usize) -> bool {
        let count = batch.len();
        self.total.fetch_add(count, Ordering::AcqRel);
        match pool.submit_bulk(batch) {
            Ok(()) => true,
            Err(e) => {
                self.total.fetch_sub(count, Ordering::AcqRel);
                *skipped += count;
                error!(target: "vellum::dump", error = %e, "Ignored {} documents: cannot enqueue tasks!", count);
                false
            }
        }
    }

    fn throttle(&self) {
        let timeout = self.handler.engine().config().dequeue_timeout();
        while !self.throttle.wait_timeout(timeout) {
            if self.processed.load(Ordering::Acquire) >= self.total.load(Ordering::Acquire) {
                break;
            }
        }
    }

    fn prepare(&self, id: Value, obj: Value, data: Data) {
        let item = match self.handler.prepare(Some(&id), None, &obj, data) {
            Ok(prepared) => Some(prepared),
            Err(e) => {
                warn!(target: "vellum::dump", id = %id, error = %e, "Cannot restore document");
                None
            }
        };
        self.queue.enqueue(item);
    }

    fn consume(&self) {
        let config = self.handler.engine().config();
        let timeout = config.dequeue_timeout();
        let interval = config.throttle_interval();
        loop {
            if let Some(item) = self.queue.wait_dequeue_timed(timeout) {
                if let Some(prepared) = item {
                    match self
                        .handler
                        .replace_document_term(&prepared.term_id, prepared.doc, false)
                    {
                        Ok(_) => {
                            self.written.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(e) => {
                            warn!(target: "vellum::dump", term_id = %prepared.term_id, error = %e, "Cannot restore document");
                        }
                    }
                }
                let processed = self.processed.fetch_add(1, Ordering::AcqRel) + 1;
                if !self.ready.load(Ordering::Acquire) && processed % interval == 0 {
                    self.throttle.signal(config.throttle_signal);
                }
                if processed % config.progress_interval == 0 {
                    info!(
                        target: "vellum::dump",
                        processed,
                        total = self.total.load(Ordering::Acquire),
                        "Restore progress"
                    );
                }
            }
            if self.ready.load(Ordering::Acquire)
                && self.processed.load(Ordering::Acquire) >= self.total.load(Ordering::Acquire)
            {
                break;
            }
        }
        self.queue.close();
        self.throttle.signal(config.throttle_limit);
    }
}

/// Read one document's fragments; `None` at the end marker
fn read_document<R: Read>(reader: &mut DumpReader<R>) -> VellumResult<Option<(Value, Data)>> {
    let mut obj = Value::Object(Map::new());
    let mut data = Data::new();
    let mut fragments = 0usize;
    loop {
        let blob = reader.read_string()?;
        if blob.is_empty() {
            break;
        }
        fragments += 1;
        let content_type = String::from_utf8(reader.read_string()?)
            .map_err(|e| corrupt_utf8("content type", e))?;
        let tag = reader.read_char()?;
        if content_type.is_empty() {
            obj = rmp_serde::from_slice(&blob)?;
            continue;
        }
        match Placement::from_tag(tag) {
            Some(placement) if placement.is_stored() => {
                data.update_stored(&content_type, None, &blob)?
            }
            Some(_) => data.update(&content_type, &blob)?,
            None => {
                return Err(VellumError::corruption(format!(
                    "Unknown placement tag {:#04x}",
                    tag
                )))
            }
        }
    }
    Ok((fragments > 0).then_some((obj, data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use serde_json::json;
    use vellum_core::{Endpoints, Method, OpenFlags};

    fn handler(engine: &Arc<Engine>, path: &str) -> DatabaseHandler {
        engine
            .handler(&Endpoints::single(path), OpenFlags::WRITABLE, Method::Put)
            .unwrap()
    }

    #[test]
    fn metadata_round_trip() {
        let engine = Engine::with_defaults();
        let src = handler(&engine, "meta-src");
        src.set_metadata("a", b"1", false, true).unwrap();
        src.set_metadata("b", b"two", true, true).unwrap();

        let mut out = Vec::new();
        let digest = src.dump_metadata(&mut out).unwrap();

        let dst = handler(&engine, "meta-dst");
        let report = dst.restore(out.as_slice()).unwrap();
        assert_eq!(report.kind, DumpKind::Metadata);
        assert_eq!(report.source, "meta-src");
        assert_eq!(report.restored, 2);
        assert!(report.digest.is_valid());
        assert_eq!(report.digest.saved, digest);
        assert_eq!(dst.get_metadata("b").unwrap(), b"two".to_vec());
    }

    #[test]
    fn empty_schema_dumps_empty_blob() {
        let engine = Engine::with_defaults();
        let src = handler(&engine, "schema-src");
        let mut out = Vec::new();
        src.dump_schema(&mut out).unwrap();

        let dst = handler(&engine, "schema-dst");
        let report = dst.restore(out.as_slice()).unwrap();
        assert_eq!(report.restored, 0);
        assert_eq!(dst.get_schema(), json!({}));
    }

    #[test]
    fn schema_round_trip_replaces() {
        let engine = Engine::with_defaults();
        let src = handler(&engine, "schema-src");
        src.write_schema(&json!({"_id": "integer", "name": "text"}), false)
            .unwrap();
        let mut out = Vec::new();
        src.dump_schema(&mut out).unwrap();

        let dst = handler(&engine, "schema-dst");
        dst.write_schema(&json!({"other": "keyword"}), false).unwrap();
        dst.restore(out.as_slice()).unwrap();
        assert_eq!(dst.get_schema(), src.get_schema());
    }

    #[test]
    fn documents_without_id_are_skipped() {
        let mut out = Vec::new();
        let mut writer = DumpWriter::new(&mut out);
        writer.write_header(DumpKind::Documents, "hand-made").unwrap();
        for obj in [json!({"_id": "kept", "a": 1}), json!({"a": 2})] {
            writer.write_string(&rmp_serde::to_vec_named(&obj).unwrap()).unwrap();
            writer.write_string(b"").unwrap();
            writer.write_char(Placement::Inline.tag()).unwrap();
            writer.write_string(b"").unwrap();
        }
        writer.write_string(b"").unwrap();
        writer.finish().unwrap();

        let engine = Engine::with_defaults();
        let dst = handler(&engine, "docs-dst");
        let report = dst.restore(out.as_slice()).unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(dst.get_document("kept").unwrap().get_field("a").unwrap(), json!(1));
    }

    #[test]
    fn undecodable_document_stops_restore_and_keeps_earlier_ones() {
        let first = rmp_serde::to_vec_named(&json!({"_id": "a", "n": 1})).unwrap();
        let second = rmp_serde::to_vec_named(&json!({"_id": "b", "n": 2})).unwrap();
        let mut out = Vec::new();
        let mut writer = DumpWriter::new(&mut out);
        writer.write_header(DumpKind::Documents, "hand-made").unwrap();
        for blob in [&first, &second] {
            writer.write_string(blob).unwrap();
            writer.write_string(b"").unwrap();
            writer.write_char(Placement::Inline.tag()).unwrap();
            writer.write_string(b"").unwrap();
        }
        writer.write_string(b"").unwrap();
        writer.finish().unwrap();

        // 0xc1 is never a valid msgpack marker
        let at = out
            .windows(second.len())
            .position(|w| w == second.as_slice())
            .unwrap();
        out[at] = 0xc1;

        let engine = Engine::with_defaults();
        let dst = handler(&engine, "undecodable-dst");
        let report = dst.restore(out.as_slice()).unwrap();
        assert!(!report.digest.complete);
        assert!(!report.digest.is_valid());
        assert_eq!(report.restored, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(dst.get_document("a").unwrap().get_field("n").unwrap(), json!(1));
        assert!(dst.get_document("b").is_err());
    }

    #[test]
    fn unknown_header_is_client_error() {
        let mut out = Vec::new();
        let mut writer = DumpWriter::new(&mut out);
        writer.write_string(b"not-a-dump").unwrap();
        writer.finish().unwrap();

        let engine = Engine::with_defaults();
        let err = handler(&engine, "x").restore(out.as_slice()).unwrap_err();
        assert!(err.is_client());
    }
}
