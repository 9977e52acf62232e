//! # Nodal Runtime Library
//!
//! A NUMA-aware parallel runtime for shared-memory multiprocessors with
//! multiple memory controllers. It lets applications express *where* memory
//! is allocated and *where* computation runs, so that data and the threads
//! touching it live on the same node.
//!
//! Three tightly coupled subsystems form the core:
//!
//! - **Memory sources** ([`MemSource`]): arena allocators each bound to one
//!   physical NUMA node, steered by a thread-local stack of allocation
//!   [`Place`]s.
//! - **Fiber scheduler** ([`task`]): a per-node priority scheduler
//!   dispatching tasks onto pinned worker threads through cooperative
//!   context switches, with work stealing and a cross-node global queue.
//! - **Synchronization** ([`task::trigger`], [`task::Mutex`]): triggerables
//!   and synchronizers that suspend fibers (not OS threads) while
//!   preserving the allocation context across suspension.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        NODAL RUNTIME                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────────┐  │
//! │  │  Topology  │   │  MemSource   │   │     Scheduler      │  │
//! │  │ (node.rs)  │   │  (mem/…)     │   │     (task/…)       │  │
//! │  └────────────┘   └──────────────┘   └────────────────────┘  │
//! │        │                 │                     │              │
//! │        └───────── place stack ───── fiber context switch ─────┘
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Environment variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `NUMA_NODES` | Physical node IDs to use (`0,2-4` syntax) | all nodes |
//! | `NUMA_THREADS` | Cap on worker threads per node | all hw threads |
//! | `NUMA_DEBUG` | Log level (`INFO`/`DEBUG`/`CRITICAL`/`NONE`) | `CRITICAL` |

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[macro_use]
pub mod log;

pub mod config;
pub mod mem;
pub mod node;
pub mod sync;
pub mod task;
pub mod topology;

// Re-exports
pub use config::RuntimeConfig;
pub use mem::msource::MemSource;
pub use mem::place::{Place, PlaceGuard};
pub use node::{CpuId, Node, NodeList};
pub use task::trigger::TriggerableRef;
pub use task::{
    distributed_exec, for_each_thread, prefault_worker_thread_storages, spawn, wait, wait_one,
    yield_now, Priority, TaskHandle,
};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Eagerly bring up topology, node mapping and the per-node schedulers.
///
/// Everything the runtime provides is lazily initialized on first use;
/// calling this is optional and merely front-loads the cost (topology
/// probing, scheduler and worker-thread creation) to a point of the
/// caller's choosing.
pub fn runtime_init() {
    let nodes = NodeList::logical_with_cpus();
    for node in nodes.iter() {
        task::scheduler::Scheduler::for_node(*node);
    }
    log_debug!("runtime up: {} schedulable nodes", nodes.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_nonempty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_runtime_init_idempotent() {
        runtime_init();
        runtime_init();
        assert!(NodeList::logical().len() >= 1);
    }
}
