//! Counting semaphore used for blocking cross-thread invocations.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A counting semaphore.
///
/// `acquire` blocks the calling thread until the count is positive, then
/// decrements it. `release` increments the count and wakes one waiter.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Current number of available resources (snapshot in time).
    pub fn available(&self) -> usize {
        *self.count.lock().unwrap()
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Decrement the count if it is positive, without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    /// Returns whether the semaphore was acquired.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(count, deadline - now).unwrap();
            count = guard;
        }
        *count -= 1;
        true
    }

    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}
