//! Fixed-size worker pool for document preparation.
//!
//! Tasks run in submission order on a fixed set of named threads. Bulk
//! submissions are all-or-nothing: either every task of a batch is queued or
//! none is, so a caller can roll back its own accounting on rejection.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::error;

/// A unit of work for the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Error returned when the pool cannot take more tasks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackpressureError {
    /// Queued tasks plus the submission exceed the pool capacity
    #[error("worker pool queue is full ({queued} queued, {requested} requested, capacity {capacity})")]
    Full {
        /// Tasks already waiting
        queued: usize,
        /// Tasks in the rejected submission
        requested: usize,
        /// Maximum queued tasks
        capacity: usize,
    },
    /// The pool was shut down
    #[error("worker pool is shut down")]
    ShutDown,
}

/// Pool metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of tasks waiting in the queue.
    pub queue_depth: usize,
    /// Number of tasks currently being executed by workers.
    pub active_tasks: usize,
    /// Total number of tasks completed since the pool was created.
    pub tasks_completed: u64,
    /// Number of worker threads.
    pub worker_count: usize,
}

struct PoolInner {
    queue: Mutex<VecDeque<Task>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

/// FIFO worker pool with bounded queue.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl WorkerPool {
    /// Create a pool with `num_threads` workers named `{name}-0`, `{name}-1`, ...
    ///
    /// At most `max_queue_depth` tasks may wait at any time.
    pub fn new(name: &str, num_threads: usize, max_queue_depth: usize) -> Self {
        let num_threads = num_threads.max(1);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth: max_queue_depth.max(1),
            tasks_completed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(&inner_clone))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self {
            inner,
            workers: Mutex::new(workers),
            num_threads,
        }
    }

    /// Submit one task.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<(), BackpressureError> {
        self.submit_bulk(vec![Box::new(work) as Task])
    }

    /// Submit every task of `batch`, or none of them.
    pub fn submit_bulk(&self, batch: Vec<Task>) -> Result<(), BackpressureError> {
        if batch.is_empty() {
            return Ok(());
        }
        {
            let mut queue = self.inner.queue.lock();
            // Checked under the lock so shutdown cannot strand the batch
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Err(BackpressureError::ShutDown);
            }
            if queue.len() + batch.len() > self.inner.max_queue_depth {
                return Err(BackpressureError::Full {
                    queued: queue.len(),
                    requested: batch.len(),
                    capacity: self.inner.max_queue_depth,
                });
            }
            let n = batch.len();
            queue.extend(batch);
            if n == 1 {
                self.inner.work_ready.notify_one();
            } else {
                self.inner.work_ready.notify_all();
            }
        }
        Ok(())
    }

    /// Block until all queued and in-flight tasks have completed.
    ///
    /// Workers keep running afterwards.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while !queue.is_empty() || self.inner.active_tasks.load(Ordering::Acquire) > 0 {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Signal workers to exit once the queue is empty and join them.
    ///
    /// Idempotent. A worker calling this (by dropping the last handle to its
    /// own pool) is not joined.
    pub fn shutdown(&self) {
        {
            let _queue = self.inner.queue.lock();
            self.inner.shutdown.store(true, Ordering::Release);
            self.inner.work_ready.notify_all();
        }

        let current = std::thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }

    /// Return a snapshot of pool metrics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue_depth: self.inner.queue.lock().len(),
            active_tasks: self.inner.active_tasks.load(Ordering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(Ordering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Decrements `active_tasks` and wakes drain waiters on drop, panics included.
struct ActiveTaskGuard<'a> {
    inner: &'a PoolInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, Ordering::Release);
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);

        if prev_active == 1 {
            let queue = self.inner.queue.lock();
            if queue.is_empty() {
                self.inner.drain_cond.notify_all();
            }
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    inner.active_tasks.fetch_add(1, Ordering::Release);
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveTaskGuard { inner };

        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            error!(
                target: "vellum::pool",
                "worker task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}
