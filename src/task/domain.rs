//! Scheduling domains: priority-ordered task collections.
//!
//! A domain owns one [`TaskCollection`] per priority level, created
//! lazily on first use, plus a monotonic *top-priority hint*: retrieval
//! scans downward from the hint, so empty high priorities cost one
//! atomic read each instead of a queue probe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::mem::msource::MemSource;
use crate::sync::SpinLock;
use crate::task::collection::{TaskCollection, TaskCounter};
use crate::task::task::{Task, PRIORITY_COUNT};
use crate::topology::Topology;

struct PrioritySlot {
    /// Lazily-created collection; the lock doubles as the init lock.
    tasks: SpinLock<Option<Arc<TaskCollection>>>,
    /// Tasks currently enqueued at this priority.
    count: TaskCounter,
}

/// All priorities of one scheduling scope (a node, or the process-wide
/// global scope).
pub struct SchedulingDomain {
    msource: MemSource,
    priorities: Vec<PrioritySlot>,
    /// High-water mark of used priority indices; readers scan down from
    /// here. Only ever advances.
    top_priority: AtomicUsize,
    /// Worker thread IDs registered with every live collection.
    active_threads: SpinLock<Vec<usize>>,
}

impl SchedulingDomain {
    /// Create a domain allocating its collections for the CPU count of
    /// `msource`'s node (or the whole machine for the global domain's
    /// unbound source).
    pub fn new(msource: MemSource) -> SchedulingDomain {
        let msource = if msource.valid() {
            msource
        } else {
            MemSource::global().clone()
        };
        let mut priorities = Vec::with_capacity(PRIORITY_COUNT);
        for _ in 0..PRIORITY_COUNT {
            priorities.push(PrioritySlot {
                tasks: SpinLock::new(None),
                count: TaskCounter::new(),
            });
        }
        SchedulingDomain {
            msource,
            priorities,
            top_priority: AtomicUsize::new(0),
            active_threads: SpinLock::new(Vec::new()),
        }
    }

    /// Queue capacity for new collections: CPUs on this domain's node,
    /// or every CPU on the machine for the unbound global domain.
    fn collection_width(&self) -> usize {
        let topo = Topology::get();
        let phys = self.msource.physical_node();
        if phys >= 0 {
            topo.cores_on_node(phys).max(1) as usize
        } else {
            (topo.max_cpu_id() + 1).max(1) as usize
        }
    }

    /// Take the highest-priority available task, preferring `thid`'s own
    /// queues. Returns `None` when every priority is empty.
    pub fn try_get_task(&self, thid: i32) -> Option<Arc<Task>> {
        let top = self.top_priority.load(Ordering::Relaxed);
        for idx in (0..=top).rev() {
            let slot = &self.priorities[idx];
            if slot.count.get() == 0 {
                continue;
            }
            let collection = slot.tasks.lock().clone();
            if let Some(collection) = collection {
                if let Some(task) = collection.try_get(thid) {
                    slot.count.decrement();
                    return Some(task);
                }
            }
        }
        None
    }

    /// Insert a task at its priority, tied to thread `thid` (-1 untied).
    pub fn put_task(&self, task: Arc<Task>, thid: i32) {
        let idx = task.priority().index();

        // Create the collection on first use, registering every active
        // thread with it.
        let collection = {
            let mut slot = self.priorities[idx].tasks.lock();
            if slot.is_none() {
                let collection = Arc::new(TaskCollection::new(self.collection_width()));
                let active = self.active_threads.lock();
                for &thread in active.iter() {
                    collection.register_thread(thread);
                }
                *slot = Some(collection);
            }
            slot.clone().expect("just initialized")
        };

        collection.put(task, thid);
        self.priorities[idx].count.increment();

        // Advance the search hint; it only ever grows.
        let mut expected = self.top_priority.load(Ordering::Relaxed);
        while idx > expected {
            match self.top_priority.compare_exchange_weak(
                expected,
                idx,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => expected = v,
            }
        }
    }

    /// Register a worker thread ID with every live collection (and every
    /// future one).
    pub fn add_thread(&self, idx: usize) {
        // Hold every slot lock plus the active list so no collection can
        // be created without this thread.
        let guards: Vec<_> = self.priorities.iter().map(|p| p.tasks.lock()).collect();
        let mut active = self.active_threads.lock();

        for slot in guards.iter() {
            if let Some(collection) = slot.as_ref() {
                collection.register_thread(idx);
            }
        }
        active.push(idx);
    }

    /// Remove a worker thread ID; its queued tasks move to the untied
    /// queues.
    pub fn remove_thread(&self, idx: usize) {
        let guards: Vec<_> = self.priorities.iter().map(|p| p.tasks.lock()).collect();
        let mut active = self.active_threads.lock();

        for slot in guards.iter() {
            if let Some(collection) = slot.as_ref() {
                collection.deregister_thread(idx);
            }
        }
        let pos = active
            .iter()
            .position(|&t| t == idx)
            .expect("removing a thread that was never added");
        active.swap_remove(pos);
    }

    /// Total number of tasks currently enqueued across all priorities.
    pub fn queued_tasks(&self) -> u64 {
        self.priorities.iter().map(|p| p.count.get()).sum()
    }
}

/// The process-wide domain every per-node scheduler also drains from.
pub fn global_domain() -> &'static SchedulingDomain {
    static GLOBAL: std::sync::OnceLock<SchedulingDomain> = std::sync::OnceLock::new();
    GLOBAL.get_or_init(|| SchedulingDomain::new(MemSource::global().clone()))
}

/// Width helper for the global domain: its source is bound to no node,
/// so collections span every CPU. Exposed for tests.
#[doc(hidden)]
pub fn machine_width() -> usize {
    (Topology::get().max_cpu_id() + 1).max(1) as usize
}
