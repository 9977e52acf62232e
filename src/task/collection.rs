//! Per-priority task collections with work stealing.
//!
//! One collection holds a spinlock-protected queue per worker thread plus
//! an untied injector queue. Retrieval order for a thread: own queue
//! first, then the untied queue, then a randomized-rotation steal across
//! the other threads' queues.
//!
//! The owning thread consumes its queue from the front (most recently
//! spawned first — newly-spawned tasks have the hottest data); stealers
//! also take from the front, which is acceptable because the workload is
//! dominated by fresh tasks with high temporal affinity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_deque::{Injector, Steal};

use crate::sync::SpinLock;
use crate::task::task::Task;

type TaskRef = Arc<Task>;

/// One worker's queue slot. `None` until the thread registers and after
/// it deregisters; the slot itself stays valid for the collection's
/// lifetime so concurrent stealers can always scan it.
struct ThreadSlot {
    queue: SpinLock<Option<VecDeque<TaskRef>>>,
}

/// All tasks of one priority that may run on a set of threads.
pub struct TaskCollection {
    /// Untied tasks, runnable by anyone.
    global_tasks: Injector<TaskRef>,
    /// Per-thread queues, indexed by worker thread ID.
    thread_tasks: Vec<ThreadSlot>,
}

impl TaskCollection {
    /// Create a collection for up to `max_threads` registered threads.
    pub fn new(max_threads: usize) -> TaskCollection {
        let mut thread_tasks = Vec::with_capacity(max_threads);
        for _ in 0..max_threads {
            thread_tasks.push(ThreadSlot {
                queue: SpinLock::new(None),
            });
        }
        TaskCollection {
            global_tasks: Injector::new(),
            thread_tasks,
        }
    }

    /// Make sure a queue exists for the given thread ID.
    pub fn register_thread(&self, idx: usize) {
        assert!(idx < self.thread_tasks.len());
        let mut queue = self.thread_tasks[idx].queue.lock();
        if queue.is_none() {
            *queue = Some(VecDeque::new());
        }
    }

    /// Drop the queue for the given thread ID, moving its remaining
    /// tasks to the untied queue. Other threads may still be scanning
    /// the slot; it stays in place and simply reads empty.
    pub fn deregister_thread(&self, idx: usize) {
        assert!(idx < self.thread_tasks.len());
        let drained = {
            let mut queue = self.thread_tasks[idx].queue.lock();
            queue.take()
        };
        if let Some(drained) = drained {
            for task in drained {
                self.global_tasks.push(task);
            }
        }
    }

    fn try_pop_thread(&self, idx: usize) -> Option<TaskRef> {
        self.thread_tasks
            .get(idx)?
            .queue
            .lock()
            .as_mut()?
            .pop_front()
    }

    /// Try to take a task for thread `thid` (-1 = untied caller).
    pub fn try_get(&self, thid: i32) -> Option<TaskRef> {
        // Own queue first.
        if thid >= 0 {
            if let Some(task) = self.try_pop_thread(thid as usize) {
                return Some(task);
            }
        }

        // Untied queue.
        loop {
            match self.global_tasks.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // Steal, starting at a random slot to avoid convoying.
        let count = self.thread_tasks.len();
        if count > 0 {
            let start = random_below(count as u64) as usize;
            for i in 0..count {
                let idx = (start + i) % count;
                if let Some(task) = self.try_pop_thread(idx) {
                    return Some(task);
                }
            }
        }

        None
    }

    /// Insert a task, preferring the queue of thread `thid`; untied when
    /// `thid` is -1 or names no registered queue.
    pub fn put(&self, task: TaskRef, thid: i32) {
        if thid >= 0 {
            if let Some(slot) = self.thread_tasks.get(thid as usize) {
                let mut queue = slot.queue.lock();
                if let Some(queue) = queue.as_mut() {
                    queue.push_back(task);
                    return;
                }
            }
        }
        self.global_tasks.push(task);
    }

    /// Number of thread slots.
    pub fn max_threads(&self) -> usize {
        self.thread_tasks.len()
    }
}

/// Cheap per-thread xorshift for steal-start randomization.
fn random_below(n: u64) -> u64 {
    use std::cell::Cell;
    thread_local! {
        static RNG: Cell<u64> = const { Cell::new(0) };
    }
    RNG.with(|rng| {
        let mut x = rng.get();
        if x == 0 {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);
            x = hasher.finish() | 1;
        }
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        rng.set(x);
        x % n.max(1)
    })
}

/// Collection-wide task counter used by the scheduling domain; kept next
/// to the collection type because the two always travel together.
pub struct TaskCounter {
    count: crossbeam_utils::CachePadded<AtomicU64>,
}

impl TaskCounter {
    /// A zeroed counter.
    pub fn new() -> Self {
        Self {
            count: crossbeam_utils::CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Current task count.
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Record an enqueue.
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dequeue.
    pub fn decrement(&self) {
        let prev = self.count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "task counter underflow");
    }
}

impl Default for TaskCounter {
    fn default() -> Self {
        Self::new()
    }
}
