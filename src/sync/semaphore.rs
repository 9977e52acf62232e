//! Counting semaphore with timed wait.
//!
//! Used by the scheduler for worker park/unpark: idle workers register as
//! sleepers and wait here with a timeout; task submission posts the
//! semaphore once per sleeper.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given initial count.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Decrement the count, blocking until it is positive.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Decrement the count, blocking at most `timeout`.
    ///
    /// Returns `true` if a permit was taken, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_for(&mut count, timeout).timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.wait();
    }

    #[test]
    fn test_timeout_expires() {
        let sem = Semaphore::new(0);
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_cross_thread_wake() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let h = thread::spawn(move || {
            sem2.wait();
        });
        sem.post();
        h.join().unwrap();
    }

    #[test]
    fn test_initial_permits() {
        let sem = Semaphore::new(2);
        assert!(sem.wait_timeout(Duration::from_millis(1)));
        assert!(sem.wait_timeout(Duration::from_millis(1)));
        assert!(!sem.wait_timeout(Duration::from_millis(1)));
    }
}
