//! Bounded blocking FIFO queue
//!
//! The hand-off between bulk preparer tasks (many producers) and the single
//! consumer of an indexing job.
//!
//! # Design
//!
//! - `enqueue` blocks while the queue is at capacity
//! - `wait_dequeue_timed` lets the consumer wake up periodically to look at
//!   its cancellation flag
//! - `close` makes every later `enqueue` a no-op and wakes blocked producers,
//!   so producers never hang on a queue nobody drains anymore
//! - `force_enqueue` ignores the capacity; it exists for control sentinels

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer blocking queue
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BlockingQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        BlockingQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append `item`, blocking while the queue is full
    ///
    /// Returns false (dropping `item`) if the queue is closed.
    pub fn enqueue(&self, item: T) -> bool {
        let mut state = self.state.lock();
        while !state.closed && state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Append `item` even if the queue is full
    ///
    /// Returns false (dropping `item`) if the queue is closed.
    pub fn force_enqueue(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Pop the oldest item, blocking until there is one
    pub fn wait_dequeue(&self) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return item;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Pop the oldest item, giving up after `timeout`
    pub fn wait_dequeue_timed(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                let item = state.items.pop_front();
                if item.is_some() {
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// Refuse further items and wake blocked producers
    ///
    /// Items already queued stay available to consumers.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_full.notify_all();
    }

    /// True once `close()` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> std::fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
