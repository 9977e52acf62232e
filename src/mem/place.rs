//! Allocation places and the thread-local place stack.
//!
//! A [`Place`] names an allocation context: a memory source, a node, or
//! both. Every thread carries a LIFO stack of places; the top of the
//! stack decides which source serves the thread's next allocation. The
//! task machinery saves and restores whole stacks around fiber
//! suspension, so a task's allocation context follows it across worker
//! threads.
//!
//! The thread-local record is created lazily on first use. Because that
//! creation itself allocates (the per-thread source, the stack), a
//! three-state init flag routes allocations *during* initialization to
//! the global source instead of recursing.

use std::cell::RefCell;

use parking_lot::Mutex;
use std::sync::OnceLock;

use crate::mem::msource::MemSource;
use crate::node::{Node, NodeList};
use crate::topology::Topology;

/// Size of each thread's own memory source.
const THREAD_SOURCE_SIZE: usize = 1 << 24;
/// Size of the remote-node sources created per (home, data) node pair.
const NODE_LOCAL_SOURCE_SIZE: usize = 1 << 24;

// ============================================================================
// Place
// ============================================================================

/// An allocation context: at least one of source and node is set.
#[derive(Clone, Debug, Default)]
pub struct Place {
    /// Explicit source; takes precedence when set.
    pub msource: Option<MemSource>,
    /// Node to allocate from when no explicit source is given.
    pub node: Option<Node>,
}

impl Place {
    /// Is at least one component set (and valid)?
    pub fn valid(&self) -> bool {
        self.msource.as_ref().map(|m| m.valid()).unwrap_or(false)
            || self.node.map(|n| n.valid()).unwrap_or(false)
    }

    /// The node this place allocates from.
    pub fn node(&self) -> Node {
        if let Some(ms) = &self.msource {
            if ms.valid() {
                return ms.logical_node();
            }
        }
        self.node.unwrap_or_else(Node::invalid)
    }
}

impl From<Node> for Place {
    fn from(node: Node) -> Self {
        Place {
            msource: None,
            node: Some(node),
        }
    }
}

impl From<MemSource> for Place {
    fn from(msource: MemSource) -> Self {
        Place {
            msource: Some(msource),
            node: None,
        }
    }
}

impl From<&MemSource> for Place {
    fn from(msource: &MemSource) -> Self {
        Place {
            msource: Some(msource.clone()),
            node: None,
        }
    }
}

/// Saved place stack of a suspended task.
pub type PlaceStack = Vec<Place>;

// ============================================================================
// Node-local storage: per-node tables of remote-capable sources
// ============================================================================

/// Sources reachable *from* one home node: its own node source plus one
/// source per remote node, created on demand with the metadata kept on
/// the home node.
struct NodeLocalStorage {
    node: i32,
    local_msource: MemSource,
    remote: Mutex<Vec<MemSource>>,
}

impl NodeLocalStorage {
    fn new(node: i32, max_node_id: i32) -> Self {
        let mut remote = Vec::new();
        remote.resize_with(max_node_id as usize + 1, MemSource::invalid);
        let local_msource = MemSource::for_node(node);
        remote[node as usize] = local_msource.clone();
        Self {
            node,
            local_msource,
            remote: Mutex::new(remote),
        }
    }

    fn get(&self, dst: i32) -> MemSource {
        let mut remote = self.remote.lock();
        assert!((dst as usize) < remote.len(), "unknown physical node {}", dst);
        if !remote[dst as usize].valid() {
            let name = format!("nodeLocal(src={} dst={})", self.node, dst);
            remote[dst as usize] =
                MemSource::create_with_home(dst, NODE_LOCAL_SOURCE_SIZE, &name, self.node);
            assert!(remote[dst as usize].valid());
        }
        remote[dst as usize].clone()
    }
}

fn node_local_storages() -> &'static Vec<Option<NodeLocalStorage>> {
    static STORAGES: OnceLock<Vec<Option<NodeLocalStorage>>> = OnceLock::new();
    STORAGES.get_or_init(|| {
        let topo = Topology::get();
        let max_id = topo.node_ids().last().copied().unwrap_or(0);
        let mut storages = Vec::new();
        storages.resize_with(max_id as usize + 1, || None);
        for &id in topo.node_ids() {
            storages[id as usize] = Some(NodeLocalStorage::new(id, max_id));
        }
        storages
    })
}

// ============================================================================
// Thread-local place stack
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum InitState {
    Uninit,
    Initializing,
    Done,
}

struct ThreadState {
    /// Physical node the thread was on at init time.
    node: i32,
    thread_msource: MemSource,
    place_stack: PlaceStack,
    /// Always equals "top of stack resolved to a source, else the
    /// thread source".
    curr_msource: MemSource,
}

impl ThreadState {
    fn create() -> ThreadState {
        let node = Topology::get().current_node_id();
        let tid = thread_id_hash();
        let name = format!("local({:X})", tid & 0xFFFF_FFFF);
        let thread_msource = MemSource::create_with_home(node, THREAD_SOURCE_SIZE, &name, -1);
        assert!(thread_msource.valid(), "cannot map thread memory source");
        ThreadState {
            node,
            thread_msource: thread_msource.clone(),
            place_stack: Vec::new(),
            curr_msource: thread_msource,
        }
    }

    fn node_msource(&self, n: i32) -> MemSource {
        if n < 0 || n == self.node {
            return self.thread_msource.clone();
        }
        let storages = node_local_storages();
        let storage = storages
            .get(self.node as usize)
            .and_then(|s| s.as_ref())
            .expect("thread runs on a node the topology reported");
        storage.get(n)
    }

    fn place_msource(&self, place: &Place) -> MemSource {
        if let Some(ms) = &place.msource {
            if ms.valid() {
                return ms.clone();
            }
        }
        let phys = place.node.map(|n| n.physical_id()).unwrap_or(-1);
        self.node_msource(phys)
    }

    fn refresh_curr(&mut self) {
        self.curr_msource = match self.place_stack.last() {
            Some(top) => {
                let top = top.clone();
                self.place_msource(&top)
            }
            None => self.thread_msource.clone(),
        };
    }
}

fn thread_id_hash() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

struct TlsSlot {
    state: InitState,
    data: Option<ThreadState>,
}

thread_local! {
    static TLS: RefCell<TlsSlot> = const {
        RefCell::new(TlsSlot {
            state: InitState::Uninit,
            data: None,
        })
    };
}

/// Run `f` against the initialized thread state, initializing first if
/// needed. Returns `None` when called re-entrantly during init.
fn with_tls<R>(f: impl FnOnce(&mut ThreadState) -> R) -> Option<R> {
    TLS.with(|slot| {
        {
            let state = slot.borrow().state;
            match state {
                InitState::Done => {}
                InitState::Initializing => return None,
                InitState::Uninit => {
                    slot.borrow_mut().state = InitState::Initializing;
                    // Building the state allocates; re-entrant calls see
                    // `Initializing` and fall back to the global source.
                    let data = ThreadState::create();
                    let mut slot = slot.borrow_mut();
                    slot.data = Some(data);
                    slot.state = InitState::Done;
                }
            }
        }
        let mut slot = slot.borrow_mut();
        Some(f(slot.data.as_mut().expect("state present after init")))
    })
}

/// Push an allocation place onto the calling thread's stack.
///
/// # Panics
///
/// Panics when the place is invalid.
pub fn push(place: Place) {
    assert!(place.valid(), "pushed an invalid place");
    with_tls(|state| {
        state.place_stack.push(place);
        state.refresh_curr();
    })
    .expect("place stack used during its own initialization");
}

/// Pop the top place. Panics on an empty stack.
pub fn pop() -> Place {
    with_tls(|state| {
        let place = state
            .place_stack
            .pop()
            .expect("pop from empty place stack");
        state.refresh_curr();
        place
    })
    .expect("place stack used during its own initialization")
}

/// Move the whole stack out (task suspension). The current source falls
/// back to the thread source.
pub fn pop_all() -> PlaceStack {
    with_tls(|state| {
        let stack = std::mem::take(&mut state.place_stack);
        state.refresh_curr();
        stack
    })
    .expect("place stack used during its own initialization")
}

/// Append a saved stack (task resumption).
pub fn push_all(stack: PlaceStack) {
    debug_assert!(stack.iter().all(Place::valid));
    with_tls(|state| {
        state.place_stack.extend(stack);
        state.refresh_curr();
    })
    .expect("place stack used during its own initialization")
}

/// Number of places currently on the calling thread's stack.
pub fn stack_depth() -> usize {
    with_tls(|state| state.place_stack.len()).unwrap_or(0)
}

/// The source serving the calling thread's next allocation.
///
/// During thread-state bootstrap this is the global source.
pub fn curr_msource() -> MemSource {
    with_tls(|state| state.curr_msource.clone()).unwrap_or_else(|| MemSource::global().clone())
}

// ============================================================================
// PlaceGuard
// ============================================================================

/// Scoped allocation context: pushes on construction, pops on drop.
///
/// ```rust,ignore
/// {
///     let _guard = PlaceGuard::new(node);
///     let buf = vec![0u8; 4 << 10]; // lands on `node` (with interposition)
/// }
/// ```
pub struct PlaceGuard {
    _private: (),
}

impl PlaceGuard {
    /// Push `place` for the lifetime of the guard.
    pub fn new(place: impl Into<Place>) -> PlaceGuard {
        push(place.into());
        PlaceGuard { _private: () }
    }
}

impl Drop for PlaceGuard {
    fn drop(&mut self) {
        pop();
    }
}

/// The first logical node's place, for tests and examples.
#[doc(hidden)]
pub fn first_node_place() -> Place {
    Place::from(NodeList::logical()[0])
}
