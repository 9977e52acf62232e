//! Test-and-set spinlocks with pause backoff.
//!
//! Two forms:
//!
//! - [`RawSpinLock`] — just the lock word. Suitable for embedding into
//!   manually-placed structures (arena headers, memory-source headers)
//!   where the protected data cannot be expressed as a Rust field.
//! - [`SpinLock<T>`] — wraps a value, hands out an RAII guard.
//!
//! Neither poisons: the runtime treats a panic while holding one of these
//! locks as a fatal bug, not a recoverable condition.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use super::backoff::ExponentialBackoff;

/// A bare test-and-set lock word.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// Create an unlocked lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire, spinning with exponential backoff.
    pub fn lock(&self) {
        let mut bkoff: ExponentialBackoff = ExponentialBackoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            bkoff.backoff();
        }
    }

    /// Try to acquire, spinning only until the backoff caps out.
    pub fn try_lock(&self) -> bool {
        let mut bkoff: ExponentialBackoff = ExponentialBackoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            if !bkoff.backoff() {
                return false;
            }
        }
        true
    }

    /// Release. Caller must hold the lock.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSpinLock")
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish()
    }
}

/// A value protected by a [`RawSpinLock`].
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `raw`.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new lock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Try to acquire without unbounded spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Mutable access without locking (requires exclusive borrow).
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

/// RAII guard for [`SpinLock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
