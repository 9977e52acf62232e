//! Triggerables and synchronizers: the runtime's wait/notify protocol.
//!
//! A [`Triggerable`] is something whose completion can be waited on. A
//! [`Synchronizer`] waits on a *set* of triggerables and gets its
//! [`notify`](Synchronizer::notify) callback invoked once the last one
//! fires.
//!
//! The protocol's central guarantee: the must-wait decision and the
//! waiter enqueue happen under one lock, so a concurrent signal either
//! sees the waiter list without the newcomer (which then observed the
//! signaled state and never waits) or finds it enqueued and signals it —
//! never both, never neither.

use std::sync::Arc;

use crate::sync::SpinLock;

/// Shared handle to a triggerable.
pub type TriggerableRef = Arc<dyn Triggerable>;
/// Shared handle to a synchronizer.
pub type SynchronizerRef = Arc<dyn Synchronizer>;

/// An entity upon whose completion synchronizers can wait.
pub trait Triggerable: Send + Sync + 'static {
    /// Register `sync` as a waiter. Returns `true` when the synchronizer
    /// actually has to wait, `false` when this triggerable is already
    /// satisfied. Implementations decide under their own lock.
    fn register_wait(&self, sync: &SynchronizerRef) -> bool;
}

/// Identity comparison over the data pointers of two refs.
fn same_triggerable(a: &TriggerableRef, b: &TriggerableRef) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ============================================================================
// TwoPhaseTrigger
// ============================================================================

struct TwoPhaseInner {
    signaled: bool,
    waiters: Vec<SynchronizerRef>,
}

/// A triggerable that transitions exactly once from unsignaled to
/// signaled, waking all registered waiters. Building block for tasks and
/// one-shot events.
pub struct TwoPhaseTrigger {
    inner: SpinLock<TwoPhaseInner>,
}

impl TwoPhaseTrigger {
    /// Create an unsignaled trigger.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(TwoPhaseInner {
                signaled: false,
                waiters: Vec::new(),
            }),
        }
    }

    /// Has the one-shot transition happened?
    pub fn is_signaled(&self) -> bool {
        self.inner.lock().signaled
    }

    /// Perform the one-shot transition and signal all waiters.
    ///
    /// `self_ref` is the triggerable identity under which waiters
    /// registered (usually the containing object).
    ///
    /// # Panics
    ///
    /// Panics when already signaled.
    pub fn set_signaled(&self, self_ref: &TriggerableRef) {
        let waiters = {
            let mut inner = self.inner.lock();
            assert!(!inner.signaled, "trigger signaled twice");
            inner.signaled = true;
            std::mem::take(&mut inner.waiters)
        };
        for sync in waiters {
            sync.signal(self_ref);
        }
    }

    /// The must-wait decision for the containing [`Triggerable`] impl.
    pub fn register_wait(&self, sync: &SynchronizerRef) -> bool {
        let mut inner = self.inner.lock();
        if inner.signaled {
            return false;
        }
        inner.waiters.push(sync.clone());
        true
    }
}

impl Default for TwoPhaseTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TwoPhaseTrigger {
    fn drop(&mut self) {
        debug_assert!(
            self.inner.get_mut().waiters.is_empty(),
            "trigger dropped with registered waiters"
        );
    }
}

/// A free-standing one-shot event.
pub struct Event {
    self_weak: std::sync::Weak<Event>,
    trigger: TwoPhaseTrigger,
}

impl Event {
    /// Create an unsignaled event.
    pub fn new() -> Arc<Event> {
        Arc::new_cyclic(|weak| Event {
            self_weak: weak.clone(),
            trigger: TwoPhaseTrigger::new(),
        })
    }

    /// Signal the event, waking all waiters.
    pub fn set(&self) {
        let r: TriggerableRef = self.self_weak.upgrade().expect("event alive in set");
        self.trigger.set_signaled(&r);
    }

    /// Has the event been signaled?
    pub fn is_set(&self) -> bool {
        self.trigger.is_signaled()
    }
}

impl Triggerable for Event {
    fn register_wait(&self, sync: &SynchronizerRef) -> bool {
        self.trigger.register_wait(sync)
    }
}

// ============================================================================
// Synchronizer
// ============================================================================

/// Dependency bookkeeping for a [`Synchronizer`]. The strong references
/// keep the awaited triggerables alive across the wait.
pub struct SyncCore {
    deps: SpinLock<Vec<TriggerableRef>>,
}

impl SyncCore {
    /// Create an empty dependency set.
    pub fn new() -> Self {
        Self {
            deps: SpinLock::new(Vec::new()),
        }
    }

    /// Is the owner currently waiting on anything?
    pub fn is_waiting(&self) -> bool {
        !self.deps.lock().is_empty()
    }

    /// Remove a fired dependency; returns `true` when the set became
    /// empty (the owner's notify must fire).
    fn remove(&self, fired: &TriggerableRef) -> bool {
        let mut deps = self.deps.lock();
        debug_assert!(!deps.is_empty(), "signal without dependencies");
        if let Some(pos) = deps.iter().position(|d| same_triggerable(d, fired)) {
            deps.swap_remove(pos);
        }
        deps.is_empty()
    }
}

impl Default for SyncCore {
    fn default() -> Self {
        Self::new()
    }
}

/// An object that waits for a set of triggerables and reacts when the
/// last one fires.
pub trait Synchronizer: Send + Sync + 'static {
    /// The dependency set.
    fn sync_core(&self) -> &SyncCore;

    /// Invoked (by whichever triggerable fired last) when the dependency
    /// set empties.
    fn notify(&self);

    /// Called by a firing triggerable.
    fn signal(&self, fired: &TriggerableRef) {
        if self.sync_core().remove(fired) {
            self.notify();
        }
    }
}

/// Register `sync` with every triggerable in `refs`. Those that report a
/// real wait become dependencies. Returns `true` iff any dependency
/// remains afterwards.
pub fn synchronize(sync: &SynchronizerRef, refs: &[TriggerableRef]) -> bool {
    let core = sync.sync_core();
    let mut deps = core.deps.lock();
    for r in refs {
        if r.register_wait(sync) {
            deps.push(r.clone());
        }
    }
    !deps.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSync {
        core: SyncCore,
        notified: AtomicUsize,
    }

    impl CountingSync {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                core: SyncCore::new(),
                notified: AtomicUsize::new(0),
            })
        }
    }

    impl Synchronizer for CountingSync {
        fn sync_core(&self) -> &SyncCore {
            &self.core
        }
        fn notify(&self) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_wait_then_signal() {
        let event = Event::new();
        let sync = CountingSync::new();
        let sref: SynchronizerRef = sync.clone();
        let tref: TriggerableRef = event.clone();

        assert!(synchronize(&sref, std::slice::from_ref(&tref)));
        assert!(sync.core.is_waiting());
        assert_eq!(sync.notified.load(Ordering::SeqCst), 0);

        event.set();
        assert_eq!(sync.notified.load(Ordering::SeqCst), 1);
        assert!(!sync.core.is_waiting());
    }

    #[test]
    fn test_already_signaled_never_waits() {
        let event = Event::new();
        event.set();

        let sync = CountingSync::new();
        let sref: SynchronizerRef = sync.clone();
        let tref: TriggerableRef = event.clone();

        assert!(!synchronize(&sref, std::slice::from_ref(&tref)));
        // Not registered, so no notify either.
        assert_eq!(sync.notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_multiple_dependencies_single_notify() {
        let a = Event::new();
        let b = Event::new();
        let sync = CountingSync::new();
        let sref: SynchronizerRef = sync.clone();
        let refs: Vec<TriggerableRef> = vec![a.clone(), b.clone()];

        assert!(synchronize(&sref, &refs));
        a.set();
        assert_eq!(sync.notified.load(Ordering::SeqCst), 0);
        b.set();
        assert_eq!(sync.notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mixed_signaled_and_pending() {
        let done = Event::new();
        done.set();
        let pending = Event::new();

        let sync = CountingSync::new();
        let sref: SynchronizerRef = sync.clone();
        let refs: Vec<TriggerableRef> = vec![done.clone(), pending.clone()];

        assert!(synchronize(&sref, &refs));
        pending.set();
        assert_eq!(sync.notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic]
    fn test_double_signal_asserts() {
        let event = Event::new();
        event.set();
        event.set();
    }

    #[test]
    fn test_concurrent_register_and_signal_exactly_once() {
        for _ in 0..200 {
            let event = Event::new();
            let sync = CountingSync::new();
            let sref: SynchronizerRef = sync.clone();
            let tref: TriggerableRef = event.clone();

            let e2 = event.clone();
            let signaler = std::thread::spawn(move || e2.set());
            let waited = synchronize(&sref, std::slice::from_ref(&tref));
            signaler.join().unwrap();

            let notified = sync.notified.load(Ordering::SeqCst);
            if waited {
                assert_eq!(notified, 1, "registered waiter must be signaled");
            } else {
                assert_eq!(notified, 0, "unregistered waiter must not be signaled");
            }
        }
    }
}
