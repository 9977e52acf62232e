//! NUMA topology discovery.
//!
//! Reads the machine layout from `/sys/devices/system/node`: which nodes
//! exist (physical IDs may be sparse), which CPUs belong to each node, the
//! pairwise distance matrix, and per-node memory sizes. On hosts without
//! that sysfs tree (non-Linux, or NUMA disabled) a single synthetic node 0
//! owning every CPU is reported, so the rest of the runtime never has to
//! special-case "no NUMA".
//!
//! The topology is probed once and immutable afterwards; dynamic node
//! hotplug is out of scope.

use std::fmt::Write as _;
use std::fs;
use std::sync::OnceLock;

use crate::node::CpuId;

/// One physical NUMA node as reported by the OS.
#[derive(Debug)]
pub struct PhysNode {
    /// OS-assigned node ID.
    pub id: i32,
    /// CPUs on this node, sorted ascending.
    pub cpus: Vec<CpuId>,
    /// Distance to every physical node, indexed by physical ID.
    /// Missing entries are -1.
    pub distances: Vec<i32>,
    /// `(distance, node_id)` pairs sorted by distance, ties by node ID.
    pub nearest_neighbors: Vec<(i32, i32)>,
    /// Node-local memory in bytes (0 if unknown).
    pub memory_size: u64,
}

impl PhysNode {
    /// Position of `cpu` within this node's CPU list, or -1.
    pub fn core_of(&self, cpu: CpuId) -> i32 {
        match self.cpus.iter().position(|&c| c == cpu) {
            Some(idx) => idx as i32,
            None => -1,
        }
    }
}

/// The probed machine topology.
#[derive(Debug)]
pub struct Topology {
    /// Nodes indexed by physical ID; `None` marks gaps in the ID space.
    nodes: Vec<Option<PhysNode>>,
    /// Sorted list of physical node IDs.
    node_ids: Vec<i32>,
    /// Physical node ID for each CPU, indexed by CPU ID (-1 = unknown).
    cpu_to_node: Vec<i32>,
    /// Total number of CPUs across all nodes.
    total_cpus: usize,
}

impl Topology {
    /// The process-wide topology, probed on first access.
    pub fn get() -> &'static Topology {
        static INSTANCE: OnceLock<Topology> = OnceLock::new();
        INSTANCE.get_or_init(Topology::probe)
    }

    fn probe() -> Topology {
        match Self::probe_sysfs() {
            Some(topo) if !topo.node_ids.is_empty() => topo,
            _ => Self::single_node_fallback(),
        }
    }

    /// Read the sysfs node tree. Returns `None` when it is absent.
    fn probe_sysfs() -> Option<Topology> {
        let online = fs::read_to_string("/sys/devices/system/node/online").ok()?;
        let node_ids = parse_id_list(online.trim())?;

        let mut nodes: Vec<Option<PhysNode>> = Vec::new();
        let mut cpu_to_node: Vec<i32> = Vec::new();
        let mut total_cpus = 0usize;

        for &id in &node_ids {
            let dir = format!("/sys/devices/system/node/node{}", id);

            let cpus = fs::read_to_string(format!("{}/cpulist", dir))
                .ok()
                .and_then(|s| parse_id_list(s.trim()))
                .unwrap_or_default();

            for &cpu in &cpus {
                let idx = cpu as usize;
                if cpu_to_node.len() <= idx {
                    cpu_to_node.resize(idx + 1, -1);
                }
                cpu_to_node[idx] = id;
                total_cpus += 1;
            }

            let memory_size = fs::read_to_string(format!("{}/meminfo", dir))
                .ok()
                .and_then(|s| parse_meminfo_kb(&s, "MemTotal"))
                .map(|kb| kb * 1024)
                .unwrap_or(0);

            let idx = id as usize;
            if nodes.len() <= idx {
                nodes.resize_with(idx + 1, || None);
            }
            nodes[idx] = Some(PhysNode {
                id,
                cpus: cpus.iter().map(|&c| c as CpuId).collect(),
                distances: Vec::new(),
                nearest_neighbors: Vec::new(),
                memory_size,
            });
        }

        // Distance matrix. A missing or short distance file leaves -1
        // entries; neighbor ordering for those is unspecified.
        let max_id = *node_ids.last()? as usize;
        for &id in &node_ids {
            let mut distances = vec![-1i32; max_id + 1];
            let mut neighbors: Vec<(i32, i32)> = Vec::new();

            let path = format!("/sys/devices/system/node/node{}/distance", id);
            match fs::read_to_string(&path) {
                Ok(text) => {
                    let values: Vec<i32> = text
                        .split_whitespace()
                        .filter_map(|t| t.parse().ok())
                        .collect();
                    for (pos, &cousin) in node_ids.iter().enumerate() {
                        match values.get(pos) {
                            Some(&d) => {
                                distances[cousin as usize] = d;
                                neighbors.push((d, cousin));
                            }
                            None => {
                                eprintln!(
                                    "nodal: could not read node distance {}->{} from {}",
                                    id, cousin, path
                                );
                            }
                        }
                    }
                }
                Err(_) => {
                    eprintln!("nodal: node distance file not readable ({})", path);
                }
            }

            neighbors.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

            let node = nodes[id as usize].as_mut().expect("node was just inserted");
            node.distances = distances;
            node.nearest_neighbors = neighbors;
        }

        Some(Topology {
            nodes,
            node_ids,
            cpu_to_node,
            total_cpus,
        })
    }

    /// One synthetic node owning every CPU.
    fn single_node_fallback() -> Topology {
        let ncpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let cpus: Vec<CpuId> = (0..ncpus as CpuId).collect();
        Topology {
            nodes: vec![Some(PhysNode {
                id: 0,
                cpus,
                distances: vec![10],
                nearest_neighbors: vec![(10, 0)],
                memory_size: 0,
            })],
            node_ids: vec![0],
            cpu_to_node: vec![0; ncpus],
            total_cpus: ncpus,
        }
    }

    /// Sorted physical node IDs (possibly sparse).
    pub fn node_ids(&self) -> &[i32] {
        &self.node_ids
    }

    /// Number of physical nodes.
    pub fn number_of_nodes(&self) -> usize {
        self.node_ids.len()
    }

    /// Total CPU count across all nodes.
    pub fn total_cpu_count(&self) -> usize {
        self.total_cpus
    }

    /// Largest CPU ID seen, or -1 if none.
    pub fn max_cpu_id(&self) -> i32 {
        self.cpu_to_node.len() as i32 - 1
    }

    /// Node with the given physical ID, if it exists.
    pub fn node(&self, id: i32) -> Option<&PhysNode> {
        if id < 0 {
            return None;
        }
        self.nodes.get(id as usize).and_then(|n| n.as_ref())
    }

    /// Physical node ID owning `cpu`, or -1.
    pub fn node_of_cpu(&self, cpu: CpuId) -> i32 {
        self.cpu_to_node.get(cpu as usize).copied().unwrap_or(-1)
    }

    /// CPUs on the node with physical ID `id` (-1 if unknown node).
    pub fn cores_on_node(&self, id: i32) -> i32 {
        match self.node(id) {
            Some(n) => n.cpus.len() as i32,
            None => -1,
        }
    }

    /// CPU the calling thread is currently running on.
    pub fn current_cpu() -> CpuId {
        #[cfg(target_os = "linux")]
        {
            // Safety: sched_getcpu has no preconditions.
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 {
                return cpu as CpuId;
            }
        }
        0
    }

    /// Physical node the calling thread is currently running on.
    pub fn current_node_id(&self) -> i32 {
        let node = self.node_of_cpu(Self::current_cpu());
        if node >= 0 {
            node
        } else {
            *self.node_ids.first().unwrap_or(&0)
        }
    }

    /// Render nodes, CPU lists, neighbors, memory and the distance matrix.
    pub fn format(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Total number of CPUs: {}", self.total_cpus);
        for &id in &self.node_ids {
            let node = self.node(id).expect("listed node exists");
            let _ = writeln!(out, "Node [{}]", id);
            let _ = write!(out, "\tCPUs: [ ");
            for cpu in &node.cpus {
                let _ = write!(out, "{} ", cpu);
            }
            let _ = writeln!(out, "]");
            let _ = write!(out, "\tNearest Neighbors: ");
            for (dist, n) in &node.nearest_neighbors {
                let _ = write!(out, "({}, {}) ", dist, n);
            }
            let _ = writeln!(out);
            let _ = writeln!(out, "\tMemory Size: {} bytes", node.memory_size);
        }
        let _ = writeln!(out, "# Distance matrix:");
        let _ = write!(out, "     ");
        for &x in &self.node_ids {
            let _ = write!(out, "{:4}", x);
        }
        let _ = writeln!(out);
        for &y in &self.node_ids {
            let _ = write!(out, "{:4} ", y);
            let ynode = self.node(y).expect("listed node exists");
            for &x in &self.node_ids {
                let d = ynode.distances.get(x as usize).copied().unwrap_or(-1);
                let _ = write!(out, "{:4}", d);
            }
            let _ = writeln!(out);
        }
        out
    }
}

/// Free memory on a physical node right now, in bytes (0 if unknown).
pub fn node_free_memory(phys_id: i32) -> u64 {
    fs::read_to_string(format!(
        "/sys/devices/system/node/node{}/meminfo",
        phys_id
    ))
    .ok()
    .and_then(|s| parse_meminfo_kb(&s, "MemFree"))
    .map(|kb| kb * 1024)
    .unwrap_or(0)
}

/// Parse a sysfs ID list like `0-3,8,10-11` into a sorted vector.
fn parse_id_list(s: &str) -> Option<Vec<i32>> {
    crate::config::parse_node_set(s)
}

/// Extract `Node N <key>: X kB` from a node meminfo file.
fn parse_meminfo_kb(text: &str, key: &str) -> Option<u64> {
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        // Lines look like: "Node 0 MemTotal:  131767832 kB"
        let _node = tokens.next()?;
        let _id = tokens.next()?;
        let k = tokens.next()?;
        if k.trim_end_matches(':') == key {
            return tokens.next()?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_something() {
        let topo = Topology::get();
        assert!(topo.number_of_nodes() >= 1);
        assert!(topo.total_cpu_count() >= 1);
        let ids = topo.node_ids();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "node IDs sorted");
    }

    #[test]
    fn test_cpu_mapping_consistent() {
        let topo = Topology::get();
        for &id in topo.node_ids() {
            let node = topo.node(id).unwrap();
            for &cpu in &node.cpus {
                assert_eq!(topo.node_of_cpu(cpu), id);
                assert!(node.core_of(cpu) >= 0);
            }
        }
    }

    #[test]
    fn test_current_cpu_is_known() {
        let topo = Topology::get();
        let cpu = Topology::current_cpu();
        assert!(topo.node_of_cpu(cpu) >= 0 || topo.number_of_nodes() == 1);
    }

    #[test]
    fn test_neighbors_sorted_by_distance() {
        let topo = Topology::get();
        for &id in topo.node_ids() {
            let node = topo.node(id).unwrap();
            assert!(node
                .nearest_neighbors
                .windows(2)
                .all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "Node 0 MemTotal:  131767832 kB\nNode 0 MemFree:  1024 kB\n";
        assert_eq!(parse_meminfo_kb(text, "MemTotal"), Some(131767832));
        assert_eq!(parse_meminfo_kb(text, "MemFree"), Some(1024));
        assert_eq!(parse_meminfo_kb(text, "MemUsed"), None);
    }

    #[test]
    fn test_format_mentions_all_nodes() {
        let topo = Topology::get();
        let text = topo.format();
        for &id in topo.node_ids() {
            assert!(text.contains(&format!("Node [{}]", id)));
        }
    }
}
