//! Bulk indexing pipeline
//!
//! ```text
//! caller ──prepare()──► batch ──submit_bulk──► preparer pool (N threads)
//!                         │                        │ prepare_document
//!                   throttle.wait()                ▼
//!                         ▲                 BlockingQueue<Prepared>
//!                         │                        │
//!                         └── signal ◄──── consumer thread (1)
//!                                                  │ replace_document_term
//!                                                  ▼
//!                                           results[index]
//! ```
//!
//! # Design
//!
//! - Each submitted object gets the next index; its result (the enriched
//!   object, or an error payload) lands at that index, so results keep the
//!   submission order whatever order the preparers finish in
//! - Preparation runs in parallel; commits run on the single consumer, so
//!   writes to the shards of one job are serialized
//! - The producer holds `throttle_limit` permits and spends one per batch;
//!   the consumer hands back `throttle_signal` permits every
//!   `throttle_interval` processed items
//! - The consumer exits when the job is ready and every submitted item is
//!   processed, or when the job is finished. Either way it closes the queue,
//!   frees the producer and sets the done latch

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use vellum_concurrency::{BlockingQueue, Latch, Semaphore};
use vellum_core::{fields, TermId, VellumError, VellumResult};
use vellum_storage::NativeDocument;

use crate::handler::DatabaseHandler;
use crate::scheduler::{BackpressureError, Task};

/// Status reported for documents the preparer pool refused
const STATUS_UNAVAILABLE: u16 = 503;

/// Item handed from the preparers to the consumer
enum Prepared {
    Write {
        term_id: TermId,
        doc: NativeDocument,
        obj: Value,
        index: usize,
    },
    Failed {
        index: usize,
        payload: Value,
    },
    Stop,
}

/// `{ "_status": <code>, "_message": [<lines>] }`
pub(crate) fn error_payload(status: u16, message: &str) -> Value {
    let mut payload = Map::new();
    payload.insert(fields::STATUS.to_string(), Value::from(status));
    payload.insert(
        fields::MESSAGE.to_string(),
        Value::Array(message.lines().map(|l| Value::String(l.to_string())).collect()),
    );
    Value::Object(payload)
}

fn error_value(e: &VellumError) -> Value {
    error_payload(e.status_code(), &e.to_string())
}

// ============================================================================
// Shared job state
// ============================================================================

/// State shared by the producer, the preparers, and the consumer
struct IndexingJob {
    handler: DatabaseHandler,
    queue: BlockingQueue<Prepared>,
    results: Mutex<Vec<Value>>,
    total: AtomicUsize,
    processed: AtomicUsize,
    indexed: AtomicUsize,
    running: AtomicBool,
    ready: AtomicBool,
    done: Latch,
    throttle: Semaphore,
}

impl IndexingJob {
    fn store_result(&self, index: usize, result: Value) {
        let mut results = self.results.lock();
        if index >= results.len() {
            results.resize(index + 1, Value::Null);
        }
        results[index] = result;
    }

    fn commit(&self, term_id: &TermId, doc: NativeDocument, obj: Value) -> Value {
        match self.handler.replace_document_term(term_id, doc, false) {
            Ok(did) => {
                self.indexed.fetch_add(1, Ordering::Relaxed);
                self.handler.enrich(did, obj)
            }
            Err(e) => {
                debug!(target: "vellum::indexer", term_id = %term_id, error = %e, "Cannot index document");
                let mut payload = error_value(&e);
                if let (Value::Object(payload), Some(id)) = (&mut payload, obj.get(fields::ID)) {
                    payload.insert(fields::ID.to_string(), id.clone());
                }
                payload
            }
        }
    }

    /// Record the outcome of one item; returns the new processed count
    fn process(&self, index: usize, result: Value) -> usize {
        self.store_result(index, result);
        self.processed.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn is_complete(&self) -> bool {
        self.ready.load(Ordering::Acquire)
            && self.processed.load(Ordering::Acquire) >= self.total.load(Ordering::Acquire)
    }

    fn consume(&self) {
        let config = self.handler.engine().config();
        let timeout = config.dequeue_timeout();
        let interval = config.throttle_interval();

        while self.running.load(Ordering::Acquire) {
            match self.queue.wait_dequeue_timed(timeout) {
                Some(Prepared::Stop) => break,
                Some(Prepared::Write {
                    term_id,
                    doc,
                    obj,
                    index,
                }) => {
                    let result = self.commit(&term_id, doc, obj);
                    let processed = self.process(index, result);
                    self.release(processed, interval);
                }
                Some(Prepared::Failed { index, payload }) => {
                    let processed = self.process(index, payload);
                    self.release(processed, interval);
                }
                None => {}
            }
            if self.is_complete() {
                break;
            }
        }

        self.queue.close();
        self.throttle.signal(config.throttle_limit);
        self.done.set();
        debug!(
            target: "vellum::indexer",
            processed = self.processed.load(Ordering::Acquire),
            total = self.total.load(Ordering::Acquire),
            "Indexing consumer done"
        );
    }

    fn release(&self, processed: usize, interval: usize) {
        if !self.ready.load(Ordering::Acquire) && processed % interval == 0 {
            let signal = self.handler.engine().config().throttle_signal;
            trace!(target: "vellum::indexer", processed, signal, "Releasing throttle");
            self.throttle.signal(signal);
        }
    }
}

// ============================================================================
// DocPreparer
// ============================================================================

/// One object waiting for preparation on the preparer pool
pub struct DocPreparer {
    job: Arc<IndexingJob>,
    obj: Value,
    index: usize,
}

impl DocPreparer {
    /// Position of this object in the job's results
    pub fn index(&self) -> usize {
        self.index
    }

    /// Prepare the object and hand it to the consumer
    ///
    /// Does nothing once the job is finished. Preparation errors become an
    /// error payload at this object's index.
    pub fn run(self) {
        let DocPreparer { job, obj, index } = self;
        if !job.running.load(Ordering::Acquire) {
            return;
        }
        let item = match job.handler.prepare_document(obj) {
            Ok(prepared) => Prepared::Write {
                term_id: prepared.term_id,
                doc: prepared.doc,
                obj: prepared.obj,
                index,
            },
            Err(e) => {
                debug!(target: "vellum::indexer", index, error = %e, "Cannot prepare document");
                Prepared::Failed {
                    index,
                    payload: error_value(&e),
                }
            }
        };
        if !job.queue.enqueue(item) {
            trace!(target: "vellum::indexer", index, "Queue closed, dropping prepared document");
        }
    }
}

// ============================================================================
// DocIndexer
// ============================================================================

/// Bulk indexing job over one handler
pub struct DocIndexer {
    job: Arc<IndexingJob>,
    batch: Vec<DocPreparer>,
    next_index: usize,
    consumer: Option<JoinHandle<()>>,
}

impl DocIndexer {
    /// Start a job writing through `handler`
    ///
    /// # Errors
    ///
    /// Client error if the handler is read-only.
    pub fn new(handler: DatabaseHandler) -> VellumResult<Self> {
        if !handler.store().is_writable() {
            return Err(VellumError::client(format!(
                "Database {} is read-only",
                handler.endpoints()
            )));
        }
        let config = handler.engine().config();
        let job = IndexingJob {
            queue: BlockingQueue::new(config.preparer_queue_depth),
            results: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            indexed: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            done: Latch::new(),
            throttle: Semaphore::new(config.throttle_limit),
            handler,
        };
        Ok(DocIndexer {
            batch: Vec::with_capacity(job.handler.engine().config().bulk_batch_size),
            job: Arc::new(job),
            next_index: 0,
            consumer: None,
        })
    }

    /// Queue `obj` for indexing; an array queues each of its elements
    ///
    /// Blocks while too many batches are in flight.
    pub fn prepare(&mut self, obj: Value) {
        match obj {
            Value::Array(items) => {
                for item in items {
                    self.prepare_one(item);
                }
            }
            other => self.prepare_one(other),
        }
    }

    fn prepare_one(&mut self, obj: Value) {
        if !self.job.running.load(Ordering::Acquire) {
            warn!(target: "vellum::indexer", "Indexing job is finished, ignoring document");
            return;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.batch.push(DocPreparer {
            job: Arc::clone(&self.job),
            obj,
            index,
        });
        if self.batch.len() >= self.job.handler.engine().config().bulk_batch_size
            && self.submit_batch()
        {
            self.throttle();
        }
    }

    /// Hand the pending batch to the preparer pool; false if it was refused
    fn submit_batch(&mut self) -> bool {
        let batch = std::mem::take(&mut self.batch);
        let count = batch.len();
        let indices: Vec<usize> = batch.iter().map(DocPreparer::index).collect();
        let tasks: Vec<Task> = batch
            .into_iter()
            .map(|preparer| Box::new(move || preparer.run()) as Task)
            .collect();

        self.job.total.fetch_add(count, Ordering::AcqRel);
        match self.job.handler.engine().preparers().submit_bulk(tasks) {
            Ok(()) => {
                self.start_consumer();
                true
            }
            Err(e) => {
                self.job.total.fetch_sub(count, Ordering::AcqRel);
                error!(target: "vellum::indexer", error = %e, "Ignored {} documents: cannot enqueue tasks!", count);
                self.reject(&indices, &e);
                false
            }
        }
    }

    fn reject(&self, indices: &[usize], e: &BackpressureError) {
        let payload = error_payload(STATUS_UNAVAILABLE, &e.to_string());
        for &index in indices {
            self.job.store_result(index, payload.clone());
        }
    }

    fn start_consumer(&mut self) {
        if self.consumer.is_some() {
            return;
        }
        let job = Arc::clone(&self.job);
        let handle = std::thread::Builder::new()
            .name("vellum-indexer".to_string())
            .spawn(move || job.consume())
            .expect("failed to spawn indexer thread");
        self.consumer = Some(handle);
    }

    /// Wait for a throttle permit
    ///
    /// Gives up once the job is finished or has nothing left in flight.
    fn throttle(&self) {
        let timeout = self.job.handler.engine().config().dequeue_timeout();
        while !self.job.throttle.wait_timeout(timeout) {
            if !self.job.running.load(Ordering::Acquire)
                || self.job.processed.load(Ordering::Acquire)
                    >= self.job.total.load(Ordering::Acquire)
            {
                break;
            }
        }
    }

    /// Submit the partial batch and wait for the job to complete
    ///
    /// `None` waits as long as it takes and `Some(Duration::ZERO)` does not
    /// wait at all. Returns true if every submitted document was processed.
    /// Documents refused by the preparer pool do not count as submitted.
    pub fn wait(&mut self, timeout: Option<Duration>) -> bool {
        if !self.batch.is_empty() {
            self.submit_batch();
        }
        self.job.ready.store(true, Ordering::Release);
        {
            let mut results = self.job.results.lock();
            if results.len() < self.next_index {
                results.resize(self.next_index, Value::Null);
            }
        }

        let total = self.job.total.load(Ordering::Acquire);
        if total > 0 {
            match timeout {
                None => self.job.done.wait(),
                Some(t) if t.is_zero() => {}
                Some(t) => {
                    self.job.done.wait_timeout(t);
                }
            }
        }
        self.job.processed.load(Ordering::Acquire) >= total
    }

    /// Stop the job
    ///
    /// Objects not yet committed are dropped; a pending or later `wait`
    /// returns false for them.
    pub fn finish(&self) {
        if self.job.running.swap(false, Ordering::AcqRel) {
            self.job.queue.force_enqueue(Prepared::Stop);
            debug!(target: "vellum::indexer", "Indexing job finished");
        }
    }

    /// Results in submission order so far
    ///
    /// `null` marks objects whose result is not in yet.
    pub fn results(&self) -> Vec<Value> {
        self.job.results.lock().clone()
    }

    /// Move the results out of the job
    pub fn take_results(&self) -> Vec<Value> {
        std::mem::take(&mut *self.job.results.lock())
    }

    /// Objects accepted by the preparer pool
    pub fn total(&self) -> usize {
        self.job.total.load(Ordering::Acquire)
    }

    /// Objects whose outcome is recorded
    pub fn processed(&self) -> usize {
        self.job.processed.load(Ordering::Acquire)
    }

    /// Objects written successfully
    pub fn indexed(&self) -> usize {
        self.job.indexed.load(Ordering::Relaxed)
    }
}

impl Drop for DocIndexer {
    fn drop(&mut self) {
        self.finish();
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for DocIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocIndexer")
            .field("handler", &self.job.handler)
            .field("total", &self.total())
            .field("processed", &self.processed())
            .field("pending", &self.batch.len())
            .finish()
    }
}
