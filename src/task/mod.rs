//! Fiber-based tasking.
//!
//! The public face of the scheduler: spawn tasks onto nodes, wait for
//! triggerables, yield, and fan work out across worker threads. Inside a
//! worker thread, waiting suspends the calling *fiber* and the worker
//! picks up other tasks; from ordinary threads the same calls block the
//! OS thread on a notification channel.

pub mod collection;
pub mod context;
pub mod domain;
pub mod mutex;
pub mod scheduler;
#[allow(clippy::module_inception)]
pub mod task;
pub mod trigger;
pub mod worker;

pub use mutex::{Mutex, MutexGuard};
pub use task::{Priority, Task, TaskHandle, TaskState};
pub use trigger::{Event, TriggerableRef};

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::mem::place::{self, PlaceGuard};
use crate::node::{Node, NodeList};
use crate::sync::SpinLock;
use crate::task::scheduler::Scheduler;
use crate::task::trigger::{synchronize, SyncCore, Synchronizer, SynchronizerRef};

// ============================================================================
// Waiting
// ============================================================================

/// Wait path for threads that are not workers: the notify callback posts
/// a channel the thread blocks on.
struct NativeThreadWait {
    core: SyncCore,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl NativeThreadWait {
    fn new() -> Arc<NativeThreadWait> {
        let (tx, rx) = bounded(1);
        Arc::new(NativeThreadWait {
            core: SyncCore::new(),
            tx,
            rx,
        })
    }

    fn wait(&self) {
        self.rx.recv().expect("wait notification channel closed");
    }
}

impl Synchronizer for NativeThreadWait {
    fn sync_core(&self) -> &SyncCore {
        &self.core
    }

    fn notify(&self) {
        let _ = self.tx.send(());
    }
}

/// Wait until every given triggerable has fired.
///
/// Inside a task this suspends the fiber; the worker continues with
/// other tasks. On a non-worker thread it blocks. An empty set returns
/// immediately from ordinary threads and acts as a plain yield inside a
/// task.
pub fn wait(refs: &[TriggerableRef]) {
    if worker::current_worker_tag().is_some() {
        worker::curr_task_wait(refs.to_vec());
    } else if !refs.is_empty() {
        let op = NativeThreadWait::new();
        let sref: SynchronizerRef = op.clone();
        if synchronize(&sref, refs) {
            op.wait();
        }
    }
}

/// Wait for a single triggerable.
pub fn wait_one(r: &TriggerableRef) {
    wait(std::slice::from_ref(r));
}

/// Give up the CPU: the calling fiber re-enters its queue and the worker
/// dispatches the next task. A no-op outside workers.
pub fn yield_now() {
    wait(&[]);
}

// ============================================================================
// Spawning
// ============================================================================

/// Spawn `f` as a task with the given priority, preferring `node`.
///
/// An invalid node means global submission: any node's workers may pick
/// the task up. The returned handle waits for completion and carries the
/// result.
pub fn spawn<T, F>(f: F, priority: Priority, node: Node) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let result = Arc::new(SpinLock::new(None));
    let task_result = result.clone();

    // Task construction happens in the target node's allocation context.
    let guard = node.valid().then(|| PlaceGuard::new(node));
    let task = Task::new(
        priority,
        Box::new(move || {
            let value = f();
            *task_result.lock() = Some(value);
        }),
    );
    drop(guard);

    let sched = node.valid().then(|| Scheduler::for_node(node));
    Scheduler::spawn_task(sched, task.clone());
    TaskHandle::new(task, result)
}

/// Spawn without node preference (global submission).
pub fn spawn_global<T, F>(f: F, priority: Priority) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    spawn(f, priority, Node::invalid())
}

/// Put one instance of `f` on every worker thread's queue of every given
/// node. Returns the completion triggers of all spawned tasks.
pub fn for_each_thread<F>(nodes: &[Node], f: F, priority: Priority) -> Vec<TriggerableRef>
where
    F: Fn() + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let mut wait_list: Vec<TriggerableRef> = Vec::new();

    for node in nodes {
        let sched = Scheduler::for_node(*node);
        for thid in sched.worker_ids() {
            let _guard = PlaceGuard::new(*node);
            let f = f.clone();
            let task = Task::new(priority, Box::new(move || f()));
            sched.put_task(task.clone(), thid as i32);
            wait_list.push(task);
        }
    }

    wait_list
}

/// Run `f` once per CPU of every given node, wait for all instances, and
/// collect their results (ordered by node, then worker).
pub fn distributed_exec<T, F>(nodes: &[Node], f: F, priority: Priority) -> Vec<T>
where
    T: Send + 'static,
    F: Fn() -> T + Send + Sync + Clone + 'static,
{
    let mut handles = Vec::new();
    for node in nodes {
        for _ in 0..node.cpu_count() {
            let f = f.clone();
            handles.push(spawn(move || f(), priority, *node));
        }
    }

    let refs: Vec<TriggerableRef> = handles.iter().map(|h| h.triggerable()).collect();
    wait(&refs);
    handles.into_iter().map(|h| h.join()).collect()
}

/// Fault pages into every worker thread's memory source so later
/// allocations do not page-fault on the hot path.
///
/// Runs one low-priority task per worker; a barrier inside keeps every
/// worker occupied until all of them have prefaulted, so no worker
/// handles two of the tasks.
pub fn prefault_worker_thread_storages(bytes: usize) {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let nodes: Vec<Node> = NodeList::logical_with_cpus().to_vec();
    let total: usize = nodes
        .iter()
        .map(|n| Scheduler::for_node(*n).worker_ids().len())
        .sum();
    if total == 0 {
        return;
    }

    let counter = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(crate::sync::Semaphore::new(0));
    let min_prefault = Arc::new(parking_lot::Mutex::new(usize::MAX));

    let c = counter.clone();
    let b = barrier.clone();
    let m = min_prefault.clone();
    let refs = for_each_thread(
        &nodes,
        move || {
            let faulted = place::curr_msource().prefault(bytes);

            // Hold every worker here until the last one arrives.
            if c.fetch_add(1, Ordering::AcqRel) == total - 1 {
                b.post();
            }
            b.wait();
            b.post();

            let mut min = m.lock();
            *min = (*min).min(faulted);
        },
        Priority::MIN,
    );
    wait(&refs);

    let min = *min_prefault.lock();
    if min == bytes {
        log_debug!("prefaulted {} bytes on {} thread msources", bytes, total);
    } else {
        log_critical!(
            "prefaulted {} bytes ({} requested) on {} thread msources",
            min,
            bytes,
            total
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wait_empty_returns_immediately() {
        wait(&[]);
        yield_now();
    }

    #[test]
    fn test_spawn_and_join() {
        let handle = spawn(|| 21 * 2, Priority::new(0), NodeList::logical_with_cpus()[0]);
        assert_eq!(handle.join(), 42);
    }

    #[test]
    fn test_spawn_global_runs() {
        let handle = spawn_global(|| "done", Priority::new(0));
        assert_eq!(handle.join(), "done");
    }

    #[test]
    fn test_spawn_invalid_node_is_global() {
        let handle = spawn(|| 7, Priority::new(0), Node::invalid());
        assert_eq!(handle.join(), 7);
    }

    #[test]
    fn test_wait_on_completed_task_returns() {
        let handle = spawn(|| (), Priority::new(0), NodeList::logical_with_cpus()[0]);
        let r = handle.triggerable();
        wait_one(&r);
        wait_one(&r); // already completed: returns immediately
        assert!(handle.is_completed());
    }

    #[test]
    fn test_for_each_thread_covers_all_workers() {
        let nodes: Vec<Node> = vec![NodeList::logical_with_cpus()[0]];
        let workers = Scheduler::for_node(nodes[0]).worker_ids().len();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let refs = for_each_thread(
            &nodes,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Priority::new(0),
        );
        assert_eq!(refs.len(), workers);
        wait(&refs);
        assert_eq!(count.load(Ordering::SeqCst), workers);
    }

    #[test]
    fn test_distributed_exec_collects_results() {
        let nodes: Vec<Node> = vec![NodeList::logical_with_cpus()[0]];
        let expected: usize = nodes.iter().map(|n| n.cpu_count()).sum();
        let results = distributed_exec(&nodes, || 1usize, Priority::new(0));
        assert_eq!(results.len(), expected);
        assert_eq!(results.iter().sum::<usize>(), expected);
    }

    #[test]
    fn test_nested_spawn_from_task() {
        let node = NodeList::logical_with_cpus()[0];
        let handle = spawn(
            move || {
                let inner = spawn(|| 10, Priority::new(2), node);
                inner.join() + 1
            },
            Priority::new(0),
            node,
        );
        assert_eq!(handle.join(), 11);
    }
}
