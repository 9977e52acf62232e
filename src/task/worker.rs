//! Worker threads and the fiber dispatch loop.
//!
//! Each worker is one OS thread pinned to one CPU. All task execution
//! happens inside *contexts* ([`Context`]); the worker's own OS stack
//! only hosts the entry/exit glue. The dispatch loop runs on a *neutral*
//! context and follows one invariant per iteration:
//!
//! 1. A set `curr_task` means that task was just interrupted — finalize
//!    it as a yield or a wait (a wait whose dependencies were already
//!    satisfied keeps the task).
//! 2. With no current task, pull one from the scheduler, backing off and
//!    finally parking while none is available; exit on shutdown.
//! 3. A task that never started is run *on the neutral context itself*
//!    (the context becomes the task's). A started task is resumed by
//!    jumping into its saved context.
//!
//! Because a task may migrate between workers across a suspension, the
//! identity of "the current worker" is re-established after every point
//! where control could have come back on a different OS thread: from the
//! thread-local after a task body returns, and from the switch payload
//! after every context jump.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::node::{CpuId, Node};
use crate::sync::backoff::LinearBackoff;
use crate::task::context::Context;
use crate::task::scheduler::Scheduler;
use crate::task::task::Task;
use crate::task::trigger::TriggerableRef;

/// Mutable loop state of one worker. Only code executing *as* this
/// worker (on its OS thread) touches it, which serializes all access.
struct WorkerState {
    curr_task: Option<Arc<Task>>,
    /// The context this worker is executing on right now.
    curr_ctx: Option<Arc<Context>>,
    /// Wait set of an interrupted task; empty means plain yield.
    task_waits: Vec<TriggerableRef>,
    /// Saved OS-thread continuation to exit the worker.
    native_sp: usize,
    /// Worker-local stash of neutral contexts.
    ready_contexts: Vec<Arc<Context>>,
}

/// An OS thread pinned to one CPU, executing tasks for its scheduler.
pub struct WorkerThread {
    scheduler: &'static Scheduler,
    id: usize,
    cpu: CpuId,
    node: Node,
    done: AtomicBool,
    state: std::cell::UnsafeCell<WorkerState>,
}

// Safety: `state` is only accessed by code running as this worker; the
// remaining fields are atomics or immutable.
unsafe impl Send for WorkerThread {}
unsafe impl Sync for WorkerThread {}

thread_local! {
    static CURRENT_WORKER: Cell<*const WorkerThread> = const { Cell::new(ptr::null()) };
}

/// `(physical node, worker id)` of the calling thread, when it is a
/// worker.
pub fn current_worker_tag() -> Option<(i32, usize)> {
    let wt = CURRENT_WORKER.with(|c| c.get());
    if wt.is_null() {
        return None;
    }
    // Safety: the pointer is valid while its thread runs.
    unsafe { Some(((*wt).node.physical_id(), (*wt).id)) }
}

fn current_worker_ptr() -> *const WorkerThread {
    CURRENT_WORKER.with(|c| c.get())
}

impl WorkerThread {
    /// Create a worker for CPU slot `id` of `scheduler`'s node.
    pub(crate) fn new(id: usize, scheduler: &'static Scheduler) -> Arc<WorkerThread> {
        let node = scheduler.node();
        let cpu = node.cpu_ids()[id];
        Arc::new(WorkerThread {
            scheduler,
            id,
            cpu,
            node,
            done: AtomicBool::new(false),
            state: std::cell::UnsafeCell::new(WorkerState {
                curr_task: None,
                curr_ctx: None,
                task_waits: Vec::new(),
                native_sp: 0,
                ready_contexts: Vec::new(),
            }),
        })
    }

    /// Worker index within its scheduler (== CPU slot).
    pub fn id(&self) -> usize {
        self.id
    }

    /// The node this worker belongs to.
    pub fn home_node(&self) -> Node {
        self.node
    }

    /// Ask the worker to exit its dispatch loop.
    pub(crate) fn shutdown(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Loop state. Caller must be executing as this worker.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state_mut(&self) -> &mut WorkerState {
        &mut *self.state.get()
    }

    /// Pull the next task, spinning briefly, then parking at the
    /// scheduler between retries. `None` means shutdown.
    fn get_new_task(&self) -> Option<Arc<Task>> {
        let mut bkoff: LinearBackoff<256, 2048> = LinearBackoff::new();
        while !self.done.load(Ordering::Acquire) {
            if let Some(task) = self.scheduler.try_get_task(self.id as i32) {
                return Some(task);
            }
            if !bkoff.backoff() {
                self.scheduler.wait_for_task(Duration::from_millis(10));
                bkoff.reset();
            }
        }
        None
    }

    fn get_neutral_context(&self) -> Arc<Context> {
        // Safety: called while executing as this worker.
        let state = unsafe { self.state_mut() };
        if let Some(ctx) = state.ready_contexts.pop() {
            return ctx;
        }
        self.scheduler.context_cache().get(worker_context_entry)
    }

    fn put_neutral_context(&self, ctx: Arc<Context>) {
        // Safety: called while executing as this worker.
        let state = unsafe { self.state_mut() };
        state.ready_contexts.push(ctx);
    }
}

/// OS-thread entry of a worker.
pub(crate) fn worker_main(worker: Arc<WorkerThread>) {
    // Pin to the worker's CPU.
    if !core_affinity::set_for_current(core_affinity::CoreId {
        id: worker.cpu as usize,
    }) {
        log_critical!(
            "could not pin worker {}.{:02} to CPU {}",
            worker.node.physical_id(),
            worker.id,
            worker.cpu
        );
    }

    CURRENT_WORKER.with(|c| c.set(Arc::as_ptr(&worker)));
    log_debug!("worker up on CPU {}", worker.cpu);

    // Enter the dispatch loop on a neutral context, saving the OS-thread
    // continuation for the final exit jump.
    let ctx = worker.get_neutral_context();
    // Safety: we are the worker's own thread.
    unsafe {
        let state = worker.state_mut();
        state.curr_ctx = Some(ctx.clone());
        let native_sp = &mut state.native_sp as *mut usize;
        ctx.jump_from(native_sp, Arc::as_ptr(&worker) as usize);
    }

    // Dispatch exited. Return parked neutral contexts to the scheduler
    // cache; the context we just left dies with its Arc.
    unsafe {
        let state = worker.state_mut();
        for ctx in state.ready_contexts.drain(..) {
            worker.scheduler.context_cache().store(ctx);
        }
        state.curr_ctx = None;
    }

    CURRENT_WORKER.with(|c| c.set(ptr::null()));
    log_debug!("worker down on CPU {}", worker.cpu);
}

/// Dispatch loop, running inside a neutral context. The payload of every
/// switch into this function (initial or resumed) is the pointer of the
/// worker now driving it.
extern "C" fn worker_context_entry(payload: usize) -> ! {
    let mut wt = payload as *const WorkerThread;

    // Safety: worker pointers stay valid while their threads run; state
    // access follows the one-thread-at-a-time discipline described on
    // WorkerState.
    unsafe {
        while !(*wt).done.load(Ordering::Acquire) {
            // 1. Finalize an interrupted task.
            let state = (*wt).state_mut();
            if let Some(task) = state.curr_task.clone() {
                if state.task_waits.is_empty() {
                    task.yield_to_queue((*wt).id as i32);
                    state.curr_task = None;
                } else {
                    let waits = std::mem::take(&mut state.task_waits);
                    if task.wait_on(&waits) {
                        state.curr_task = None;
                    }
                    // Dependencies were already satisfied: keep the task
                    // and resume it below.
                }
            }

            // 2. Pull new work.
            if state.curr_task.is_none() {
                match (*wt).get_new_task() {
                    Some(task) => state.curr_task = Some(task),
                    None => break,
                }
            }

            let task = state.curr_task.clone().expect("task chosen above");
            if !task.has_started() {
                // 3. Fresh task: it runs on this very context.
                task.schedule((*wt).id as i32, (*wt).scheduler);
                let ctx = state.curr_ctx.clone().expect("worker has a context");
                task.run(ctx);

                // The body returned, possibly on a different worker than
                // the one that started it.
                wt = current_worker_ptr();
                debug_assert!(!wt.is_null());
                let state = (*wt).state_mut();
                let task = state.curr_task.clone().expect("completed task current");
                task.complete();
                state.curr_task = None;
            } else {
                // 4. Interrupted task: resume its own context. When this
                // neutral context is reactivated later, the payload names
                // the worker driving it then.
                task.schedule((*wt).id as i32, (*wt).scheduler);
                let ctx = state.curr_ctx.clone().expect("worker has a context");
                let resumed = ctx.jump_to(&task.get_context(), wt as usize);
                wt = resumed as *const WorkerThread;
            }
        }

        // Shutdown: back to the OS-thread continuation.
        let state = (*wt).state_mut();
        let ctx = state.curr_ctx.clone().expect("worker has a context");
        ctx.jump_to_sp(state.native_sp, 0);
    }
    unreachable!("worker context resumed after exit");
}

/// Suspend the task currently running on this worker until the given
/// triggerables fire (empty set = plain yield). Must be called from
/// inside a task.
pub(crate) fn curr_task_wait(waits: Vec<TriggerableRef>) {
    let wt = current_worker_ptr();
    assert!(!wt.is_null(), "task suspension outside a worker thread");

    // Safety: we are executing as worker `wt`, inside its current task's
    // context.
    unsafe {
        let state = (*wt).state_mut();
        debug_assert!(state.curr_task.is_some(), "suspension without a task");
        state.task_waits = waits;

        // Adopt a neutral context for the dispatch loop and park this
        // (the task's) context.
        let neutral = (*wt).get_neutral_context();
        let task_ctx = state.curr_task.as_ref().expect("current task").get_context();
        state.curr_ctx = Some(neutral.clone());
        let resumed = task_ctx.jump_to(&neutral, wt as usize);

        // Resumed: some worker jumped back into this task context. Swap
        // its former neutral context into the ready stash and make this
        // context its current one.
        let wt = resumed as *const WorkerThread;
        let state = (*wt).state_mut();
        let this_ctx = state.curr_task.as_ref().expect("resumed task").get_context();
        let old_neutral = state
            .curr_ctx
            .replace(this_ctx)
            .expect("resuming worker has a context");
        (*wt).put_neutral_context(old_neutral);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeList;

    #[test]
    fn test_non_worker_has_no_tag() {
        assert!(current_worker_tag().is_none());
    }

    #[test]
    fn test_workers_report_tags() {
        use parking_lot::Mutex;

        let node = NodeList::logical_with_cpus()[0];
        let sched = Scheduler::for_node(node);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let task = Task::new(
            crate::task::Priority::default(),
            Box::new(move || {
                seen2.lock().push(current_worker_tag());
            }),
        );
        Scheduler::spawn_task(Some(sched), task.clone());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !task.is_completed() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let (phys, id) = seen[0].expect("task ran on a worker");
        assert_eq!(phys, node.physical_id());
        assert!(id < node.cpu_count());
    }
}
