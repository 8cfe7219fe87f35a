//! Error types, node identifiers, and sentinels for the scheduling substrate.

use std::fmt;
use thiserror::Error;

/// A NUMA node identifier, or one of the reserved sentinel values below.
///
/// Sentinels are never valid indices into [`crate::topology::Topology`]'s
/// per-node vectors; callers must check [`NodeId::is_real`] (or rely on
/// [`crate::scheduler::Scheduler::determine_queue`], which already does)
/// before indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

/// Use the executing worker's node.
pub const CURRENT_NODE_ID: NodeId = NodeId(u32::MAX);
/// No preference; let the scheduler pick.
pub const INVALID_NODE_ID: NodeId = NodeId(u32::MAX - 1);
/// Topology could not determine a node; treated identically to `INVALID`.
pub const UNKNOWN_NODE_ID: NodeId = NodeId(u32::MAX - 2);

impl NodeId {
    /// A sentinel is never a real, indexable node id.
    pub fn is_real(self, num_nodes: usize) -> bool {
        self != CURRENT_NODE_ID
            && self != INVALID_NODE_ID
            && self != UNKNOWN_NODE_ID
            && (self.0 as usize) < num_nodes
    }

    /// Index into a per-node vector. Panics if called on a sentinel; callers
    /// must have already checked [`NodeId::is_real`].
    pub fn index(self) -> usize {
        debug_assert!(
            self != CURRENT_NODE_ID && self != INVALID_NODE_ID && self != UNKNOWN_NODE_ID,
            "attempted to index a sentinel NodeId"
        );
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CURRENT_NODE_ID => write!(f, "<current>"),
            INVALID_NODE_ID => write!(f, "<invalid>"),
            UNKNOWN_NODE_ID => write!(f, "<unknown>"),
            NodeId(n) => write!(f, "{n}"),
        }
    }
}

/// A unique, monotonically assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reportable failures of the scheduling substrate.
///
/// Invariant violations (duplicate arena registration, a cycle in the task
/// graph, scheduling after [`crate::scheduler::Scheduler::finish`], waiting on
/// an unscheduled task) are programmer errors and remain `panic!`s — see the
/// error handling discussion in SPEC_FULL.md §7. This enum covers only the
/// subset of failures a caller can meaningfully recover from.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    /// `mallctl("arenas.create", ...)` failed.
    #[error("failed to create jemalloc arena: {reason}")]
    ArenaCreationFailed {
        /// Raw errno or mallctl return code, stringified.
        reason: String,
    },

    /// The extent `alloc` hook's `mmap` call failed.
    #[error("failed to map {size} bytes for a NUMA extent")]
    ExtentMapFailed {
        /// Requested (page-rounded) size in bytes.
        size: usize,
    },

    /// `NumaMemoryResource::new(node)` was asked for a node outside the
    /// topology's valid range.
    #[error("node {node} is not a valid NUMA node (topology has {num_nodes} nodes)")]
    InvalidNode {
        /// The node that was requested.
        node: NodeId,
        /// The number of nodes in the discovered topology.
        num_nodes: usize,
    },

    /// A scheduling call was made while the scheduler was not active.
    #[error("scheduler is not active: begin() was not called or finish() already ran")]
    NotActive,
}

/// Result type alias for this crate's reportable failures.
pub type Result<T> = std::result::Result<T, SchedulerError>;
