//! Fiber-aware mutual exclusion.
//!
//! Unlike [`crate::sync::SpinLock`], contending on this mutex suspends
//! the calling *fiber* — the worker thread moves on to other tasks.
//! Ownership passes directly from the releasing task to the oldest
//! waiter, so the lock is FIFO-fair among fibers.
//!
//! Usable from non-worker threads too; those block on the native-thread
//! wait path instead of suspending a fiber.

use std::sync::Arc;

use crate::sync::SpinLock;
use crate::task::trigger::{SynchronizerRef, Triggerable, TriggerableRef};

struct WaitInner {
    locked: bool,
    waiters: Vec<SynchronizerRef>,
}

/// The triggerable a blocked locker waits on. The must-wait decision
/// doubles as the acquisition attempt: an unlocked mutex is taken by the
/// very act of deciding "no wait needed".
struct WaitObject {
    inner: SpinLock<WaitInner>,
}

impl Triggerable for WaitObject {
    fn register_wait(&self, sync: &SynchronizerRef) -> bool {
        let mut inner = self.inner.lock();
        let was_locked = inner.locked;
        inner.locked = true;
        if was_locked {
            inner.waiters.push(sync.clone());
        }
        was_locked
    }
}

impl WaitObject {
    /// Hand the lock to the oldest waiter, or mark it free.
    fn release(&self, self_ref: &TriggerableRef) {
        let next = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.locked, "unlock of an unlocked mutex");
            if inner.waiters.is_empty() {
                inner.locked = false;
                None
            } else {
                // Ownership transfers; `locked` stays set.
                Some(inner.waiters.remove(0))
            }
        };
        if let Some(waiter) = next {
            waiter.signal(self_ref);
        }
    }
}

/// A fiber-suspending mutex.
pub struct Mutex {
    wait: Arc<WaitObject>,
}

impl Mutex {
    /// Create an unlocked mutex.
    pub fn new() -> Mutex {
        Mutex {
            wait: Arc::new(WaitObject {
                inner: SpinLock::new(WaitInner {
                    locked: false,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Acquire the mutex, suspending the calling fiber while it is held
    /// elsewhere.
    pub fn lock(&self) {
        let tref: TriggerableRef = self.wait.clone();
        crate::task::wait_one(&tref);
    }

    /// Release the mutex.
    ///
    /// Must be called by the current owner; the runtime does not track
    /// owner identity.
    pub fn unlock(&self) {
        let tref: TriggerableRef = self.wait.clone();
        self.wait.release(&tref);
    }

    /// Acquire and return a guard releasing on drop.
    pub fn guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`Mutex`].
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncontended_lock_unlock() {
        let m = Mutex::new();
        m.lock();
        assert!(m.wait.inner.lock().locked);
        m.unlock();
        assert!(!m.wait.inner.lock().locked);
    }

    #[test]
    fn test_guard_unlocks_on_drop() {
        let m = Mutex::new();
        {
            let _g = m.guard();
            assert!(m.wait.inner.lock().locked);
        }
        assert!(!m.wait.inner.lock().locked);
    }

    #[test]
    fn test_native_thread_contention() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let m = Arc::new(Mutex::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = m.clone();
            let in_section = in_section.clone();
            let total = total.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    m.lock();
                    assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                    total.fetch_add(1, Ordering::SeqCst);
                    in_section.fetch_sub(1, Ordering::SeqCst);
                    m.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 400);
    }
}
