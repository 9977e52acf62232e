//! Bit-flagged reader-writer lock.
//!
//! One atomic word: the write flag lives in a high bit, the reader count
//! in the low bits. Protocol:
//!
//! - readers spin while the write flag is set, then CAS the count up;
//! - writers CAS the flag in, then spin until the reader count drains;
//! - unlock clears the flag / decrements the count.
//!
//! Writers are not fair with respect to each other; the runtime uses this
//! lock for read-mostly tables where writer contention is negligible.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use super::backoff::LinearBackoff;

const FLAG_WRITE: u64 = 1 << 62;

/// A reader-writer lock around a value.
pub struct RwLock<T: ?Sized> {
    value: AtomicU64,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by the lock protocol.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Create an unlocked lock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            value: AtomicU64::new(0),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    fn read_lock(&self) {
        let mut bkoff: LinearBackoff<64, 4096> = LinearBackoff::new();
        let mut old = self.value.load(Ordering::Relaxed);
        loop {
            if old & FLAG_WRITE != 0 {
                bkoff.backoff();
                old = self.value.load(Ordering::Relaxed);
            } else {
                match self.value.compare_exchange_weak(
                    old,
                    old + 1,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(v) => old = v,
                }
            }
        }
    }

    fn read_unlock(&self) {
        let prev = self.value.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & !FLAG_WRITE > 0, "read_unlock without readers");
    }

    fn write_lock(&self) {
        let mut bkoff: LinearBackoff<64, 4096> = LinearBackoff::new();
        let mut old = self.value.load(Ordering::Relaxed);
        loop {
            if old & FLAG_WRITE != 0 {
                bkoff.backoff();
                old = self.value.load(Ordering::Relaxed);
            } else {
                match self.value.compare_exchange_weak(
                    old,
                    old | FLAG_WRITE,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(v) => old = v,
                }
            }
        }

        // Wait for in-flight readers to drain.
        bkoff.reset();
        while self.value.load(Ordering::Acquire) != FLAG_WRITE {
            bkoff.backoff();
        }
    }

    fn write_unlock(&self) {
        debug_assert_eq!(self.value.load(Ordering::Relaxed), FLAG_WRITE);
        self.value.store(0, Ordering::Release);
    }

    /// Acquire shared read access.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.read_lock();
        RwLockReadGuard { lock: self }
    }

    /// Acquire exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.write_lock();
        RwLockWriteGuard { lock: self }
    }

    /// Current number of readers (diagnostic).
    pub fn reader_count(&self) -> u64 {
        self.value.load(Ordering::Relaxed) & !FLAG_WRITE
    }

    /// Is a writer currently holding the lock (diagnostic)?
    pub fn is_write_locked(&self) -> bool {
        self.value.load(Ordering::Relaxed) & FLAG_WRITE != 0
    }
}

impl<T: fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("readers", &self.reader_count())
            .field("write_locked", &self.is_write_locked())
            .finish()
    }
}

/// Shared-access RAII guard.
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: readers hold the count; no writer can be active.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Exclusive-access RAII guard.
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the write flag is held exclusively.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the write flag is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_then_write() {
        let lock = RwLock::new(1usize);
        {
            let r1 = lock.read();
            let r2 = lock.read();
            assert_eq!(*r1 + *r2, 2);
            assert_eq!(lock.reader_count(), 2);
        }
        {
            let mut w = lock.write();
            *w = 5;
            assert!(lock.is_write_locked());
        }
        assert_eq!(*lock.read(), 5);
    }

    #[test]
    fn test_no_reader_during_write() {
        let lock = Arc::new(RwLock::new(0usize));
        let in_write = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let lock = lock.clone();
            let in_write = in_write.clone();
            let violations = violations.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..2_000 {
                    if i == 0 {
                        let mut w = lock.write();
                        in_write.store(true, Ordering::SeqCst);
                        *w += 1;
                        in_write.store(false, Ordering::SeqCst);
                    } else {
                        let _r = lock.read();
                        if in_write.load(Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(*lock.read(), 2_000);
    }
}
