//! Per-node schedulers.
//!
//! Exactly one scheduler exists per logical node, created lazily and
//! alive until process exit. Each owns the node's scheduling domain, a
//! context cache, and one worker-thread slot per CPU of the node.
//! Retrieval prefers the local domain over the process-wide global
//! domain, so node-affine tasks win over stealable globals.
//!
//! Idle workers park on a semaphore with a timeout; every submission
//! wakes all current sleepers (they re-park if they still find nothing).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::mem::msource::MemSource;
use crate::node::{Node, NodeList};
use crate::sync::Semaphore;
use crate::task::context::ContextCache;
use crate::task::domain::{global_domain, SchedulingDomain};
use crate::task::task::Task;
use crate::task::worker::{self, WorkerThread};

struct WorkerSlot {
    worker: Arc<WorkerThread>,
    join: Option<JoinHandle<()>>,
}

struct WorkerTable {
    slots: Vec<Option<WorkerSlot>>,
}

/// The scheduler of one node.
pub struct Scheduler {
    node: Node,
    msource: MemSource,
    domain: SchedulingDomain,
    workers: Mutex<WorkerTable>,
    context_cache: ContextCache,
    sleeping_threads: AtomicUsize,
    sleep_sem: Semaphore,
}

impl Scheduler {
    fn new(node: Node) -> Scheduler {
        assert!(node.valid());
        let msource = MemSource::for_node(node.physical_id());
        let cores = node.cpu_count();
        let mut slots = Vec::with_capacity(cores);
        slots.resize_with(cores, || None);

        Scheduler {
            node,
            msource: msource.clone(),
            domain: SchedulingDomain::new(msource.clone()),
            workers: Mutex::new(WorkerTable { slots }),
            context_cache: ContextCache::new(msource),
            sleeping_threads: AtomicUsize::new(0),
            sleep_sem: Semaphore::new(0),
        }
    }

    /// The scheduler of `node`, created (with its worker threads) on
    /// first use.
    pub fn for_node(node: Node) -> &'static Scheduler {
        assert!(node.valid(), "scheduler lookup for invalid node");

        static SCHEDULERS: OnceLock<Vec<OnceLock<&'static Scheduler>>> = OnceLock::new();
        let table = SCHEDULERS.get_or_init(|| {
            let mut v = Vec::new();
            v.resize_with(NodeList::logical_count(), OnceLock::new);
            v
        });

        table[node.logical_id() as usize].get_or_init(|| {
            let sched: &'static Scheduler = Box::leak(Box::new(Scheduler::new(node)));
            sched.set_thread_count(node.thread_count());
            log_debug!(
                "scheduler up on node {} with {} workers",
                node.physical_id(),
                node.thread_count()
            );
            sched
        })
    }

    /// This scheduler's node.
    pub fn node(&self) -> Node {
        self.node
    }

    /// The node's memory source backing scheduler structures.
    pub fn msource(&self) -> &MemSource {
        &self.msource
    }

    /// The reusable-context cache.
    pub(crate) fn context_cache(&self) -> &ContextCache {
        &self.context_cache
    }

    /// Worker IDs currently running.
    pub fn worker_ids(&self) -> Vec<usize> {
        let table = self.workers.lock();
        table
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i)
            .collect()
    }

    /// Start a worker on `core` (index into the node's CPU list).
    fn create_thread_locked(&'static self, table: &mut WorkerTable, core: usize) {
        assert!(core < table.slots.len());
        assert!(table.slots[core].is_none());

        let worker = WorkerThread::new(core, self);
        self.domain.add_thread(core);

        let thread_worker = worker.clone();
        let join = std::thread::Builder::new()
            .name(format!(
                "nodal-worker-{}.{:02}",
                self.node.physical_id(),
                core
            ))
            .spawn(move || worker::worker_main(thread_worker))
            .expect("failed to spawn worker thread");

        table.slots[core] = Some(WorkerSlot {
            worker,
            join: Some(join),
        });
    }

    /// Stop the worker on `core` and wait for its thread to exit.
    fn stop_thread_locked(&self, table: &mut WorkerTable, core: usize) {
        assert!(core < table.slots.len());
        let mut slot = table.slots[core].take().expect("stopping an empty slot");

        self.domain.remove_thread(core);
        slot.worker.shutdown();
        // Wake it if it sleeps; a shutting-down worker re-checks its flag
        // on every wakeup.
        self.wake_all_sleepers();

        if let Some(join) = slot.join.take() {
            let _ = join.join();
        }
    }

    /// Grow or shrink the worker set toward `count`.
    pub fn set_thread_count(&'static self, count: usize) {
        let mut table = self.workers.lock();
        let cores = table.slots.len();
        assert!(count <= cores);

        let mut curr = table.slots.iter().filter(|s| s.is_some()).count();

        for core in 0..cores {
            if curr >= count {
                break;
            }
            if table.slots[core].is_none() {
                self.create_thread_locked(&mut table, core);
                curr += 1;
            }
        }

        for core in (0..cores).rev() {
            if curr <= count {
                break;
            }
            if table.slots[core].is_some() {
                self.stop_thread_locked(&mut table, core);
                curr -= 1;
            }
        }
    }

    /// Submit a task: into `sched`'s local domain, or into the global
    /// domain (waking every node) when `sched` is `None`.
    pub fn spawn_task(sched: Option<&'static Scheduler>, task: Arc<Task>) {
        match sched {
            None => {
                global_domain().put_task(task, -1);
                // Conservative broadcast: any node may pick it up, and
                // every node's workers might all be parked.
                for node in NodeList::logical_with_cpus() {
                    Scheduler::for_node(*node).task_available();
                }
            }
            Some(sched) => {
                // Prefer the submitting worker's own queue when it
                // belongs to this node.
                let mut thid = -1;
                if let Some((node, id)) = worker::current_worker_tag() {
                    if node == sched.node.physical_id() {
                        thid = id as i32;
                    }
                }
                sched.put_task(task, thid);
            }
        }
    }

    /// Take a runnable task for worker `thid`: local domain first, then
    /// the global domain.
    pub(crate) fn try_get_task(&self, thid: i32) -> Option<Arc<Task>> {
        if let Some(task) = self.domain.try_get_task(thid) {
            return Some(task);
        }
        global_domain().try_get_task(-1)
    }

    /// Enqueue into the local domain and wake sleepers.
    pub fn put_task(&self, task: Arc<Task>, thid: i32) {
        self.task_available();
        self.domain.put_task(task, thid);
    }

    /// Wake every currently-parked worker.
    pub(crate) fn task_available(&self) {
        if self.sleeping_threads.load(Ordering::Relaxed) > 0 {
            self.wake_all_sleepers();
        }
    }

    fn wake_all_sleepers(&self) {
        let sleepers = self.sleeping_threads.swap(0, Ordering::AcqRel);
        for _ in 0..sleepers {
            self.sleep_sem.post();
        }
    }

    /// Park the calling worker until a submission or the timeout.
    pub(crate) fn wait_for_task(&self, timeout: Duration) {
        self.sleeping_threads.fetch_add(1, Ordering::AcqRel);
        self.sleep_sem.wait_timeout(timeout);
    }

    /// Tasks queued in the local domain right now.
    pub fn queued_tasks(&self) -> u64 {
        self.domain.queued_tasks()
    }
}
