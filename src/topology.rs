//! Topology oracle (SPEC_FULL.md §4.A) and node-sorted steal order (§4.B).
//!
//! Generalizes `/sys`-based node/CPU discovery to also report the pairwise
//! distance matrix, and adds the distance-sorted priority matrix used as
//! each worker's steal order.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use crate::error::NodeId;

/// Square `num_nodes x num_nodes` matrix of positive distances. Row-major:
/// `distances.at(a, b)` is the cost of accessing node `b`'s memory from node
/// `a`. The diagonal is the self-distance (conventionally the lowest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceMatrix {
    num_nodes: usize,
    values: Vec<u32>,
}

impl DistanceMatrix {
    pub(crate) fn new(num_nodes: usize, values: Vec<u32>) -> Self {
        assert_eq!(values.len(), num_nodes * num_nodes);
        Self { num_nodes, values }
    }

    /// Uniform matrix used when the OS cannot report real distances.
    pub(crate) fn uniform(num_nodes: usize, distance: u32) -> Self {
        Self::new(num_nodes, vec![distance; num_nodes * num_nodes])
    }

    /// Distance from node `a` to node `b`.
    pub fn at(&self, a: usize, b: usize) -> u32 {
        self.values[a * self.num_nodes + b]
    }

    /// Number of nodes this matrix covers.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Whether the matrix is symmetric. Callers are expected to assume
    /// symmetry but asymmetric matrices are tolerated and used as given;
    /// this is a diagnostic, not an enforced precondition.
    pub fn is_symmetric(&self) -> bool {
        (0..self.num_nodes)
            .all(|a| (0..self.num_nodes).all(|b| self.at(a, b) == self.at(b, a)))
    }
}

impl fmt::Display for DistanceMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for a in 0..self.num_nodes {
            for b in 0..self.num_nodes {
                write!(f, "{:>4}", self.at(a, b))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// For each node, the permutation of all node ids sorted by ascending
/// distance from that node; ties broken by ascending id. The entry's own id
/// is always first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMatrix {
    rows: Vec<Vec<NodeId>>,
}

impl NodeMatrix {
    /// The steal order for `node`: `row[0] == node`, non-decreasing distance
    /// thereafter.
    pub fn row(&self, node: NodeId) -> &[NodeId] {
        &self.rows[node.index()]
    }
}

/// Pure function: derive the per-node steal order from a distance matrix.
///
/// Grounded on `original_source/src/lib/utils/numa.cpp`'s
/// `sort_relative_node_ids`: for each row, sort column indices by the row's
/// distance values ascending, ties broken by ascending index.
pub fn sort_relative(distances: &DistanceMatrix) -> NodeMatrix {
    let n = distances.num_nodes();
    let mut rows = Vec::with_capacity(n);
    for from in 0..n {
        let mut ids: Vec<u32> = (0..n as u32).collect();
        ids.sort_by(|&l, &r| {
            distances
                .at(from, l as usize)
                .cmp(&distances.at(from, r as usize))
                .then(l.cmp(&r))
        });
        rows.push(ids.into_iter().map(NodeId).collect());
    }
    NodeMatrix { rows }
}

/// Discovers the number of NUMA nodes, their CPUs, and the pairwise distance
/// matrix. Static for the process lifetime once constructed.
#[derive(Debug)]
pub struct Topology {
    num_nodes: usize,
    node_to_cpus: Vec<Vec<usize>>,
    distances: DistanceMatrix,
}

impl Topology {
    /// Discover the host's NUMA topology. Degrades to a single node with
    /// uniform distances when the host lacks NUMA support.
    pub fn discover() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Some((num_nodes, node_to_cpus)) = Self::discover_linux() {
                let distances = Self::discover_distances(num_nodes);
                return Self { num_nodes, node_to_cpus, distances };
            }
        }
        Self::single_node()
    }

    fn single_node() -> Self {
        let cpus = (0..num_cpus::get()).collect();
        Self {
            num_nodes: 1,
            node_to_cpus: vec![cpus],
            distances: DistanceMatrix::uniform(1, 10),
        }
    }

    #[cfg(target_os = "linux")]
    fn discover_linux() -> Option<(usize, Vec<Vec<usize>>)> {
        let entries = std::fs::read_dir("/sys/devices/system/node/").ok()?;
        let mut node_to_cpus: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut num_nodes = 0usize;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id_str) = name.strip_prefix("node") else { continue };
            let Ok(node_id) = id_str.parse::<usize>() else { continue };

            num_nodes = num_nodes.max(node_id + 1);
            let cpulist_path = entry.path().join("cpulist");
            if let Ok(cpulist) = std::fs::read_to_string(cpulist_path) {
                node_to_cpus.insert(node_id, parse_cpu_list(&cpulist));
            }
        }

        if num_nodes <= 1 {
            return None;
        }

        let mut ordered = vec![Vec::new(); num_nodes];
        for (node, cpus) in node_to_cpus {
            ordered[node] = cpus;
        }
        Some((num_nodes, ordered))
    }

    /// Query the OS distance matrix. On failure, returns the uniform matrix
    /// and emits a one-shot performance warning (SPEC_FULL.md §4.A). A
    /// single-node topology never needs this: `numa.cpp`'s own guard checks
    /// `numa_distance(num_nodes - 1, num_nodes - 1)`, which is moot for one
    /// node, so no warning fires in that case either.
    #[cfg(target_os = "linux")]
    fn discover_distances(num_nodes: usize) -> DistanceMatrix {
        let mut values = vec![10u32; num_nodes * num_nodes];
        let mut any_real = false;

        for a in 0..num_nodes {
            for b in 0..num_nodes {
                if let Some(d) = read_distance(a, b) {
                    values[a * num_nodes + b] = d;
                    any_real = true;
                }
            }
        }

        if !any_real && num_nodes > 1 {
            tracing::warn!(
                "NUMA distance between nodes could not be determined; \
                 falling back to a uniform distance for every interconnect"
            );
        }

        DistanceMatrix::new(num_nodes, values)
    }

    /// Number of NUMA nodes discovered.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// CPU ids belonging to `node`.
    pub fn cpus_of(&self, node: NodeId) -> &[usize] {
        &self.node_to_cpus[node.index()]
    }

    /// All CPU ids across all nodes, in node order.
    pub fn all_cpus(&self) -> impl Iterator<Item = (NodeId, usize)> + '_ {
        self.node_to_cpus.iter().enumerate().flat_map(|(node, cpus)| {
            cpus.iter().map(move |&cpu| (NodeId(node as u32), cpu))
        })
    }

    /// The discovered (or degraded-fallback) distance matrix.
    pub fn distances(&self) -> &DistanceMatrix {
        &self.distances
    }
}

static GLOBAL: OnceLock<Topology> = OnceLock::new();

/// The process-wide topology, discovered once and cached. `Scheduler::begin`
/// and `NumaMemoryResource::new` both read through this so that every part of
/// the substrate agrees on the same node count and CPU layout.
pub fn global() -> &'static Topology {
    GLOBAL.get_or_init(Topology::discover)
}

/// Parse a `/sys`-style CPU list such as `"0-3,8-11"`.
fn parse_cpu_list(cpulist: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in cpulist.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// Read `/sys/devices/system/node/nodeA/distance`, which lists the distance
/// from node A to every other node in order, and pick out the entry for B.
#[cfg(target_os = "linux")]
fn read_distance(a: usize, b: usize) -> Option<u32> {
    let path = format!("/sys/devices/system/node/node{a}/distance");
    let contents = std::fs::read_to_string(path).ok()?;
    contents.split_whitespace().nth(b)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix3() -> DistanceMatrix {
        // Matches spec.md §8 scenario 4.
        DistanceMatrix::new(3, vec![10, 20, 30, 20, 10, 25, 30, 25, 10])
    }

    #[test]
    fn sort_relative_own_id_first() {
        let order = sort_relative(&matrix3());
        for n in 0..3 {
            assert_eq!(order.row(NodeId(n as u32))[0], NodeId(n as u32));
        }
    }

    #[test]
    fn sort_relative_ascending_distance() {
        let order = sort_relative(&matrix3());
        let row0 = order.row(NodeId(0));
        assert_eq!(row0, &[NodeId(0), NodeId(1), NodeId(2)]);
        let row2 = order.row(NodeId(2));
        assert_eq!(row2, &[NodeId(2), NodeId(1), NodeId(0)]);
    }

    #[test]
    fn sort_relative_ties_break_ascending_id() {
        let tied = DistanceMatrix::new(3, vec![10, 20, 20, 20, 10, 20, 20, 20, 10]);
        let order = sort_relative(&tied);
        assert_eq!(order.row(NodeId(0)), &[NodeId(0), NodeId(1), NodeId(2)]);
    }

    #[test]
    fn single_node_topology_has_no_sentinel_collision() {
        let topo = Topology::single_node();
        assert_eq!(topo.num_nodes(), 1);
        assert!(!topo.cpus_of(NodeId(0)).is_empty());
        assert!(topo.distances().is_symmetric());
    }

    #[test]
    fn parse_cpu_list_ranges_and_singles() {
        assert_eq!(parse_cpu_list("0-3,8-11"), vec![0, 1, 2, 3, 8, 9, 10, 11]);
        assert_eq!(parse_cpu_list("5"), vec![5]);
        assert_eq!(parse_cpu_list(""), Vec::<usize>::new());
    }
}
