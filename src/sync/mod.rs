//! Low-level synchronization primitives.
//!
//! These are OS-thread-level primitives used throughout the runtime's own
//! data structures. They never suspend fibers; the fiber-aware mutex lives
//! in [`crate::task::Mutex`].
//!
//! - [`SpinLock`] / [`RawSpinLock`] — test-and-set locks with pause-based
//!   backoff, usable inside manually-placed memory (no poisoning, no heap).
//! - [`RwLock`] — bit-flagged reader-writer lock (write flag in the high
//!   bit, reader count in the low bits).
//! - [`Semaphore`] — counting semaphore with timed wait, used for worker
//!   parking.

pub mod backoff;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;

pub use backoff::{ExponentialBackoff, LinearBackoff};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
