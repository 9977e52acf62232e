//! End-to-end runtime scenarios.
//!
//! These exercise the full stack: topology → memory sources → place
//! stack → scheduler → workers. Scenarios needing more than one NUMA
//! node skip themselves on single-node hosts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nodal::mem::place;
use nodal::task::scheduler::Scheduler;
use nodal::task::{self, Priority, Task};
use nodal::{spawn, wait, wait_one, MemSource, Node, NodeList, PlaceGuard, TriggerableRef};

fn first_cpu_node() -> Node {
    NodeList::logical_with_cpus()[0]
}

fn wait_all(refs: &[TriggerableRef]) {
    wait(refs);
}

#[test]
fn local_affinity() {
    // A task spawned on node A allocates through its place context;
    // every buffer must report A as its backing node.
    let node = first_cpu_node();
    let mismatches = Arc::new(AtomicUsize::new(0));

    let mut refs = Vec::new();
    for _ in 0..1000 {
        let mismatches = mismatches.clone();
        let handle = spawn(
            move || {
                let ms = place::curr_msource();
                let buf = ms.alloc(16 * 1024);
                assert!(!buf.is_null());
                if MemSource::node_of(buf).physical_id() != node.physical_id() {
                    mismatches.fetch_add(1, Ordering::Relaxed);
                }
                MemSource::free(buf);
            },
            Priority::new(0),
            node,
        );
        refs.push(handle.triggerable());
    }
    wait_all(&refs);

    assert_eq!(mismatches.load(Ordering::Relaxed), 0);
}

#[test]
fn migration_moves_backing_pages() {
    let nodes = NodeList::logical();
    if nodes.len() < 2 {
        eprintln!("migration_moves_backing_pages: single-node host, skipping");
        return;
    }
    let src = nodes[0].physical_id();
    let dst = nodes[1].physical_id();

    let ms = MemSource::create_with_home(src, 1 << 22, "migration-test", -1);
    assert!(ms.valid());

    // ~64 MiB total: a mix of small arena blocks and large mapped ones.
    let mut ptrs = Vec::new();
    for i in 0..531 {
        let size = if i % 17 == 0 { 2 << 20 } else { 4 << 10 };
        let p = ms.alloc(size);
        assert!(!p.is_null());
        unsafe { p.write_bytes(0x7E, size) };
        ptrs.push(p);
    }

    let pages = ms.migrate(dst);
    assert!(pages > 0);
    assert_eq!(ms.physical_node(), dst);

    // Sample the survivors; every queryable page must be on dst.
    for &p in ptrs.iter().step_by(5).take(100) {
        let backing = nodal::mem::sysalloc::node_of_page(p);
        if backing >= 0 {
            assert_eq!(backing, dst, "page not migrated");
        }
    }

    for p in ptrs {
        MemSource::free(p);
    }
}

#[test]
fn fiber_mutex_is_exclusive() {
    let node = first_cpu_node();
    let mutex = Arc::new(task::Mutex::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let in_section = Arc::new(AtomicUsize::new(0));

    let mut refs = Vec::new();
    for _ in 0..100 {
        let mutex = mutex.clone();
        let counter = counter.clone();
        let in_section = in_section.clone();
        let handle = spawn(
            move || {
                mutex.lock();
                let sentinel = in_section.fetch_add(1, Ordering::SeqCst);
                assert_eq!(sentinel, 0, "two fibers inside the critical section");
                counter.fetch_add(1, Ordering::SeqCst);
                in_section.fetch_sub(1, Ordering::SeqCst);
                mutex.unlock();
            },
            Priority::new(0),
            node,
        );
        refs.push(handle.triggerable());
    }
    wait_all(&refs);

    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[test]
fn place_stack_survives_wait() {
    let node = first_cpu_node();
    let ms = MemSource::create(node, 1 << 22, "place-across-wait");
    assert!(ms.valid());

    let ms_for_task = ms.clone();
    let handle = spawn(
        move || {
            let other = spawn(
                || {
                    // Give the waiter a real chance to suspend first.
                    std::thread::sleep(Duration::from_millis(20));
                },
                Priority::new(0),
                Node::invalid(),
            );

            place::push(place::Place::from(&ms_for_task));
            wait_one(&other.triggerable());

            // Resumed, possibly on a different worker: the allocation
            // context must have followed the fiber.
            let current = place::curr_msource();
            assert!(current.same_as(&ms_for_task), "place stack lost across wait");
            place::pop();
        },
        Priority::new(0),
        node,
    );
    handle.join();
}

#[test]
fn work_stealing_drains_one_queue() {
    let node = first_cpu_node();
    let sched = Scheduler::for_node(node);
    let workers = sched.worker_ids();
    if workers.len() < 2 {
        eprintln!("work_stealing_drains_one_queue: single worker, skipping");
        return;
    }

    let by_owner = Arc::new(AtomicUsize::new(0));
    let by_thief = Arc::new(AtomicUsize::new(0));

    let mut refs: Vec<TriggerableRef> = Vec::new();
    for _ in 0..10_000 {
        let by_owner = by_owner.clone();
        let by_thief = by_thief.clone();
        let task = Task::new(
            Priority::new(0),
            Box::new(move || {
                match nodal::task::worker::current_worker_tag() {
                    Some((_, 0)) => by_owner.fetch_add(1, Ordering::Relaxed),
                    _ => by_thief.fetch_add(1, Ordering::Relaxed),
                };
            }),
        );
        // Everything lands in worker 0's queue.
        sched.put_task(task.clone(), 0);
        refs.push(task);
    }

    let start = Instant::now();
    wait_all(&refs);
    let elapsed = start.elapsed();

    let owner = by_owner.load(Ordering::Relaxed);
    let thief = by_thief.load(Ordering::Relaxed);
    assert_eq!(owner + thief, 10_000, "all tasks completed");
    assert!(thief > 0, "no stealing happened");
    assert!(
        elapsed < Duration::from_secs(5),
        "draining took {:?}",
        elapsed
    );
}

#[test]
fn node_mapping_laws() {
    // Logical IDs form a dense, sorted prefix.
    let nodes = NodeList::logical();
    assert!(!nodes.is_empty());
    for (i, node) in nodes.iter().enumerate() {
        assert_eq!(node.logical_id(), i as i32);
        assert_eq!(
            NodeList::physical_to_logical(node.physical_id()),
            node.logical_id()
        );
    }

    // Unknown physical IDs map to -1.
    let beyond = nodes.iter().map(|n| n.physical_id()).max().unwrap() + 1000;
    assert_eq!(NodeList::physical_to_logical(beyond), -1);
    assert_eq!(NodeList::physical_to_logical(-3), -1);
}

#[test]
fn empty_wait_and_yield_complete() {
    // From a native thread both are no-ops.
    wait(&[]);
    task::yield_now();

    // From inside a fiber, yielding must come back.
    let node = first_cpu_node();
    let handle = spawn(
        || {
            for _ in 0..10 {
                task::yield_now();
            }
            true
        },
        Priority::new(0),
        node,
    );
    assert!(handle.join());
}

#[test]
fn nested_waits_preserve_results() {
    // A chain of tasks each waiting on the next; completion propagates
    // back up with every place stack intact.
    let node = first_cpu_node();
    fn chain(depth: usize, node: Node) -> usize {
        if depth == 0 {
            return 0;
        }
        let inner = spawn(move || chain(depth - 1, node), Priority::new(0), node);
        inner.join() + 1
    }

    let handle = spawn(move || chain(8, node), Priority::new(0), node);
    assert_eq!(handle.join(), 8);
}

#[test]
fn guard_scoped_allocation_follows_node() {
    let node = first_cpu_node();
    let _guard = PlaceGuard::new(node);
    let ms = place::curr_msource();
    let p = ms.alloc(4096);
    assert!(!p.is_null());
    assert_eq!(
        MemSource::node_of(p).physical_id(),
        node.physical_id()
    );
    MemSource::free(p);
}

#[test]
fn prefault_worker_storages_touches_all() {
    // Must terminate and leave the runtime functional.
    task::prefault_worker_thread_storages(1 << 16);
    let handle = spawn(|| 5, Priority::new(0), first_cpu_node());
    assert_eq!(handle.join(), 5);
}

#[test]
fn distributed_exec_runs_per_cpu() {
    let nodes: Vec<Node> = NodeList::logical_with_cpus().to_vec();
    let expected: usize = nodes.iter().map(|n| n.cpu_count()).sum();
    let results = task::distributed_exec(&nodes, || 2usize, Priority::new(0));
    assert_eq!(results.len(), expected);
    assert!(results.iter().all(|&r| r == 2));
}
