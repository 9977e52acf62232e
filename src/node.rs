//! Application-visible nodes and the physical→logical mapping.
//!
//! The OS assigns *physical* node IDs which may be sparse and may include
//! memory-only nodes. Applications work with *logical* IDs: a dense
//! 0..k-1 index over the nodes enabled for this run. The mapping is
//! derived once at startup from the topology and the `NUMA_NODES`
//! configuration.
//!
//! A [`Node`] is a `(physical, logical)` ID pair; both IDs must be >= 0
//! for the node to be valid.

use std::fmt;
use std::sync::OnceLock;

use crate::config;
use crate::topology::Topology;

/// OS CPU identifier.
pub type CpuId = i32;

/// Sentinel states used inside the physical→logical mapping vector.
const UNKNOWN_PHYS: i32 = -2;
const UNUSED_NODE: i32 = -1;

/// A NUMA node as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    physical_id: i32,
    logical_id: i32,
}

impl Node {
    /// The invalid node (both IDs -1).
    pub const fn invalid() -> Self {
        Self {
            physical_id: -1,
            logical_id: -1,
        }
    }

    pub(crate) fn from_ids(physical_id: i32, logical_id: i32) -> Self {
        Self {
            physical_id,
            logical_id,
        }
    }

    /// The node the calling thread is currently running on.
    pub fn current() -> Node {
        Self::for_cpu(Topology::current_cpu())
    }

    /// The node owning the given CPU.
    pub fn for_cpu(cpu: CpuId) -> Node {
        let phys = Topology::get().node_of_cpu(cpu);
        Node {
            physical_id: phys,
            logical_id: NodeList::physical_to_logical(phys),
        }
    }

    /// The CPU the calling thread is currently running on.
    pub fn current_cpu() -> CpuId {
        Topology::current_cpu()
    }

    /// OS-assigned node ID (may be sparse across nodes).
    pub fn physical_id(&self) -> i32 {
        self.physical_id
    }

    /// Dense application-visible ID.
    pub fn logical_id(&self) -> i32 {
        self.logical_id
    }

    /// Both IDs assigned?
    pub fn valid(&self) -> bool {
        self.physical_id >= 0 && self.logical_id >= 0
    }

    /// Number of CPUs on this node.
    pub fn cpu_count(&self) -> usize {
        Topology::get()
            .node(self.physical_id)
            .map(|n| n.cpus.len())
            .unwrap_or(0)
    }

    /// CPUs on this node, sorted ascending.
    pub fn cpu_ids(&self) -> &'static [CpuId] {
        Topology::get()
            .node(self.physical_id)
            .map(|n| n.cpus.as_slice())
            .unwrap_or(&[])
    }

    /// Position of `cpu` within this node's CPU list, or -1.
    pub fn index_of_cpu(&self, cpu: CpuId) -> i32 {
        Topology::get()
            .node(self.physical_id)
            .map(|n| n.core_of(cpu))
            .unwrap_or(-1)
    }

    /// Worker threads this node should run:
    /// `min(hw_threads, NUMA_THREADS)`, where an unset/zero cap means all.
    pub fn thread_count(&self) -> usize {
        if !self.valid() {
            return 0;
        }
        let hw = self.cpu_count();
        match config::get().thread_cap {
            0 => hw,
            cap => hw.min(cap),
        }
    }

    /// Node-local memory in bytes (0 if unknown).
    pub fn memory_size(&self) -> u64 {
        Topology::get()
            .node(self.physical_id)
            .map(|n| n.memory_size)
            .unwrap_or(0)
    }

    /// Free node-local memory in bytes right now (0 if unknown).
    pub fn free_memory(&self) -> u64 {
        crate::topology::node_free_memory(self.physical_id)
    }

    /// Up to `max_count` nearest neighbor nodes, closest first.
    ///
    /// With `with_cpus_only`, memory-only nodes are skipped. Only nodes
    /// enabled for this run appear.
    pub fn nearest_neighbors(&self, max_count: usize, with_cpus_only: bool) -> Vec<Node> {
        let mut neighbors = Vec::new();
        if !self.valid() {
            debug_assert!(false, "nearest_neighbors on invalid node");
            return neighbors;
        }
        let phys = match Topology::get().node(self.physical_id) {
            Some(n) => n,
            None => return neighbors,
        };

        for &(_dist, cousin) in &phys.nearest_neighbors {
            if neighbors.len() == max_count {
                break;
            }
            let logical = NodeList::physical_to_logical(cousin);
            if logical < 0 {
                continue;
            }
            let node = NodeList::logical()[logical as usize];
            if with_cpus_only && node.cpu_count() == 0 {
                continue;
            }
            neighbors.push(node);
        }

        neighbors
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::invalid()
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.physical_id.cmp(&other.physical_id)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node(phys={}, log={})", self.physical_id, self.logical_id)
    }
}

/// The active node lists and the physical→logical mapping.
pub struct NodeList;

struct Mapping {
    /// Indexed by physical ID: >=0 logical ID, -1 unused, -2 nonexistent.
    phys_to_logical: Vec<i32>,
    /// All enabled nodes, sorted by logical ID.
    logical: Vec<Node>,
    /// Enabled nodes that own at least one CPU.
    logical_with_cpus: Vec<Node>,
}

fn mapping() -> &'static Mapping {
    static MAPPING: OnceLock<Mapping> = OnceLock::new();
    MAPPING.get_or_init(|| {
        let topo = Topology::get();
        let phys_to_logical = build_mapping(
            topo.node_ids(),
            config::get().node_set.as_deref(),
        );

        let mut logical = Vec::new();
        for (phys, &log) in phys_to_logical.iter().enumerate() {
            if log >= 0 {
                logical.push(Node::from_ids(phys as i32, log));
            }
        }
        logical.sort_by_key(|n| n.logical_id);

        let logical_with_cpus = logical
            .iter()
            .copied()
            .filter(|n| n.cpu_count() > 0)
            .collect();

        if crate::log::enabled(crate::log::LogLevel::Debug) {
            let used: Vec<i32> = logical.iter().map(|n| n.physical_id).collect();
            log_debug!(
                "using nodes {:?} (set NUMA_NODES environment variable to change)",
                used
            );
        }

        Mapping {
            phys_to_logical,
            logical,
            logical_with_cpus,
        }
    })
}

/// Build the physical→logical mapping vector.
///
/// `physical_ids` is the sorted list the topology reports; `requested`
/// comes from `NUMA_NODES` (already sorted). Any invalid request falls
/// back to enabling every node.
fn build_mapping(physical_ids: &[i32], requested: Option<&[i32]>) -> Vec<i32> {
    if physical_ids.is_empty() {
        eprintln!("nodal: warning: no NUMA nodes detected");
        return Vec::new();
    }

    let max_phys = *physical_ids.last().expect("non-empty") as usize;
    let mut result = vec![UNKNOWN_PHYS; max_phys + 1];

    let use_all = |result: &mut Vec<i32>| {
        let mut next = 0;
        for &phys in physical_ids {
            result[phys as usize] = next;
            next += 1;
        }
    };

    let requested = match requested {
        Some(r) => r,
        None => {
            use_all(&mut result);
            return result;
        }
    };

    let mut ok = !requested.is_empty();
    if ok && *requested.last().expect("non-empty") as usize > max_phys {
        eprintln!(
            "nodal: requested invalid NUMA node ID, valid maximum ID is {}",
            max_phys
        );
        ok = false;
    }

    if ok {
        for &phys in physical_ids {
            result[phys as usize] = UNUSED_NODE;
        }
        let mut next_logical = 0;
        for &n in requested {
            let slot = &mut result[n as usize];
            if *slot == UNKNOWN_PHYS {
                eprintln!("nodal: physical node with ID {} does not exist", n);
                ok = false;
                break;
            }
            if *slot >= 0 {
                eprintln!(
                    "nodal: warning: physical node with ID {} requested multiple times",
                    n
                );
                continue;
            }
            *slot = next_logical;
            next_logical += 1;
        }
    }

    if !ok {
        eprintln!("nodal: invalid node configuration, using all nodes");
        result.fill(UNKNOWN_PHYS);
        use_all(&mut result);
    }

    result
}

impl NodeList {
    /// All enabled nodes, sorted by logical ID (a contiguous 0..k-1).
    pub fn logical() -> &'static [Node] {
        &mapping().logical
    }

    /// Enabled nodes that own at least one CPU.
    pub fn logical_with_cpus() -> &'static [Node] {
        &mapping().logical_with_cpus
    }

    /// Number of enabled nodes.
    pub fn logical_count() -> usize {
        mapping().logical.len()
    }

    /// Number of enabled nodes with CPUs.
    pub fn logical_with_cpus_count() -> usize {
        mapping().logical_with_cpus.len()
    }

    /// Map a physical node ID to its logical ID, or -1.
    pub fn physical_to_logical(physical_id: i32) -> i32 {
        let m = &mapping().phys_to_logical;
        if physical_id < 0 || physical_id as usize >= m.len() {
            return -1;
        }
        // -2 (nonexistent) collapses to -1 for the caller.
        m[physical_id as usize].max(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_mapping_all() {
        let m = build_mapping(&[0, 2, 5], None);
        assert_eq!(m[0], 0);
        assert_eq!(m[1], UNKNOWN_PHYS);
        assert_eq!(m[2], 1);
        assert_eq!(m[5], 2);
    }

    #[test]
    fn test_build_mapping_subset() {
        let m = build_mapping(&[0, 1, 2, 3], Some(&[0, 2]));
        assert_eq!(m[0], 0);
        assert_eq!(m[1], UNUSED_NODE);
        assert_eq!(m[2], 1);
        assert_eq!(m[3], UNUSED_NODE);
    }

    #[test]
    fn test_build_mapping_invalid_falls_back() {
        // Requested ID beyond the maximum: every node stays enabled.
        let m = build_mapping(&[0, 1], Some(&[0, 7]));
        assert_eq!(m[0], 0);
        assert_eq!(m[1], 1);
        // Requested ID in a gap: same fallback.
        let m = build_mapping(&[0, 2], Some(&[1]));
        assert_eq!(m[0], 0);
        assert_eq!(m[2], 1);
    }

    #[test]
    fn test_build_mapping_duplicates_ignored() {
        let m = build_mapping(&[0, 1, 2], Some(&[1, 1, 2]));
        assert_eq!(m[0], UNUSED_NODE);
        assert_eq!(m[1], 0);
        assert_eq!(m[2], 1);
    }

    #[test]
    fn test_logical_list_is_dense_and_sorted() {
        let nodes = NodeList::logical();
        for (i, node) in nodes.iter().enumerate() {
            assert_eq!(node.logical_id(), i as i32);
            assert!(node.valid());
        }
    }

    #[test]
    fn test_physical_to_logical_roundtrip() {
        for node in NodeList::logical() {
            assert_eq!(
                NodeList::physical_to_logical(node.physical_id()),
                node.logical_id()
            );
        }
        assert_eq!(NodeList::physical_to_logical(-1), -1);
        assert_eq!(NodeList::physical_to_logical(i32::MAX), -1);
    }

    #[test]
    fn test_current_node_valid() {
        let node = Node::current();
        // The current CPU's node can only be invalid when NUMA_NODES
        // excluded it; in the default configuration it must be valid.
        if config::get().node_set.is_none() {
            assert!(node.valid());
        }
    }

    #[test]
    fn test_invalid_node() {
        let node = Node::invalid();
        assert!(!node.valid());
        assert_eq!(node.cpu_count(), 0);
        assert_eq!(node.thread_count(), 0);
    }

    #[test]
    fn test_node_ordering_by_physical() {
        let a = Node::from_ids(1, 5);
        let b = Node::from_ids(3, 0);
        assert!(a < b);
    }
}
