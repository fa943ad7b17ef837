//! Blocking signalling primitives
//!
//! - `Semaphore`: counting semaphore used as the bulk throttle. Producers
//!   `wait()` for a permit after each submitted batch; the consumer releases
//!   permits in groups with `signal(n)`.
//! - `Latch`: one-shot completion signal. Once set it stays set, so any
//!   number of waiters (and late waiters) return immediately.
//!
//! Both are built on parking_lot `Mutex` + `Condvar`. Neither spins.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` permits
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Take one permit, blocking until one is available
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take one permit, giving up after `timeout`
    ///
    /// Returns true if a permit was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_until(&mut permits, deadline).timed_out() {
                break;
            }
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Take one permit if one is available right now
    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Release `n` permits
    pub fn signal(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut permits = self.permits.lock();
        *permits += n;
        if n == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Permits currently available
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

/// One-shot completion signal
#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Create an unset latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake every waiter
    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    /// True once `set()` has been called
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Block until the latch is set
    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// Block until the latch is set or `timeout` passes
    ///
    /// Returns true if the latch is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                break;
            }
        }
        *set
    }
}
