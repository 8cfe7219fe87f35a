//! Per-node NUMA memory resource (SPEC_FULL.md §4.C).
//!
//! Builds a page-pool allocator into a real jemalloc arena with a custom
//! extent hook: create an arena via `mallctl("arenas.create", ...)`,
//! register its id against a NUMA node in a process-wide map, install an
//! extent-hook descriptor whose `alloc` callback maps pages and binds them to
//! that node, and route every subsequent `mallocx`/`sdallocx` through the
//! arena with the thread cache disabled.

use std::collections::HashMap;
use std::ffi::{c_int, c_uint, c_void, CString};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::cache_aligned::CacheAlignedCounter;
use crate::error::{NodeId, Result, SchedulerError};
use crate::topology;

/// Extent rounding granularity (SPEC_FULL.md §4.C / §9, configurable via
/// [`crate::scheduler::SchedulerConfig`] but fixed here at its default since
/// the extent hooks are free functions with no access to per-instance
/// config).
pub const PAGE_SIZE: usize = 4096;

// jemalloc's public `extent_hooks_t` ABI (see jemalloc's `jemalloc/jemalloc.h`
// and the `arena.<i>.extent_hooks` mallctl). `tikv-jemalloc-sys`'s generated
// bindings don't expose this struct, so it is declared here to match
// jemalloc's documented layout -- the same thing the original C++
// implementation does with its own `arena_config_s` shim.
type ExtentAllocFn = unsafe extern "C" fn(
    extent_hooks: *mut ExtentHooks,
    new_addr: *mut c_void,
    size: usize,
    alignment: usize,
    zero: *mut bool,
    commit: *mut bool,
    arena_ind: c_uint,
) -> *mut c_void;

type ExtentDallocFn = unsafe extern "C" fn(
    extent_hooks: *mut ExtentHooks,
    addr: *mut c_void,
    size: usize,
    committed: bool,
    arena_ind: c_uint,
) -> bool;

#[repr(C)]
struct ExtentHooks {
    alloc: Option<ExtentAllocFn>,
    dalloc: Option<ExtentDallocFn>,
    destroy: *const c_void,
    commit: *const c_void,
    decommit: *const c_void,
    purge_lazy: *const c_void,
    purge_forced: *const c_void,
    split: *const c_void,
    merge: *const c_void,
}

// Safety: the hook struct is only ever read by jemalloc internals after
// installation; no interior mutability is exposed to Rust code.
unsafe impl Send for ExtentHooks {}
unsafe impl Sync for ExtentHooks {}

fn mallocx_arena(arena: u32) -> c_int {
    ((arena as c_int) + 1) << 20
}

const MALLOCX_TCACHE_NONE: c_int = (-1 + 2) << 8;

fn mallocx_lg_align(alignment: usize) -> c_int {
    if alignment <= 1 {
        return 0;
    }
    alignment.trailing_zeros() as c_int
}

/// Diagnostic (non-load-bearing) counters for a single node's extent
/// allocations, per SPEC_FULL.md §3.
#[derive(Debug, Default)]
pub struct NodeAllocStats {
    extents: CacheAlignedCounter,
    bytes: CacheAlignedCounter,
}

impl NodeAllocStats {
    /// Number of extent-hook `alloc` calls serviced for this node.
    pub fn extent_count(&self) -> u64 {
        self.extents.get()
    }

    /// Cumulative page-rounded bytes mapped for this node.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes.get()
    }
}

struct Registry {
    arena_to_node: HashMap<u32, NodeId>,
    stats: HashMap<u32, NodeAllocStats>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            arena_to_node: HashMap::new(),
            stats: HashMap::new(),
        })
    })
}

/// Register `arena_id -> node_id`. Invariant violation (panics) if the arena
/// id is already registered; arena ids are allocated fresh by jemalloc for
/// every [`NumaMemoryResource::new`] call and must never collide.
fn register_arena(arena_id: u32, node_id: NodeId) {
    let mut reg = registry().lock();
    assert!(
        !reg.arena_to_node.contains_key(&arena_id),
        "arena {arena_id} registered twice"
    );
    reg.arena_to_node.insert(arena_id, node_id);
    reg.stats.insert(arena_id, NodeAllocStats::default());
}

fn node_for_arena(arena_ind: u32) -> NodeId {
    registry()
        .lock()
        .arena_to_node
        .get(&arena_ind)
        .copied()
        .unwrap_or_else(|| panic!("extent hook invoked for unregistered arena {arena_ind}"))
}

fn record_extent_alloc(arena_ind: u32, size: usize) {
    let reg = registry().lock();
    if let Some(stats) = reg.stats.get(&arena_ind) {
        stats.extents.increment();
        stats.bytes.add(size as u64);
    }
}

/// Extent `alloc` hook: round to page granularity, map anonymous private
/// read-write pages, and bind them to the node registered for this arena.
unsafe extern "C" fn extent_alloc(
    _extent_hooks: *mut ExtentHooks,
    _new_addr: *mut c_void,
    size: usize,
    _alignment: usize,
    zero: *mut bool,
    commit: *mut bool,
    arena_ind: c_uint,
) -> *mut c_void {
    let rounded = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let node = node_for_arena(arena_ind);

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            rounded,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        panic!("failed to mmap {rounded} bytes for NUMA extent on node {node}");
    }

    bind_to_node(addr, rounded, node);
    record_extent_alloc(arena_ind, rounded);

    unsafe {
        if !zero.is_null() {
            *zero = true;
        }
        if !commit.is_null() {
            *commit = true;
        }
    }
    addr
}

/// Extent `dalloc` hook: unmap the region. Returns `false` (jemalloc's
/// "did not fail" sentinel for this hook).
unsafe extern "C" fn extent_dalloc(
    _extent_hooks: *mut ExtentHooks,
    addr: *mut c_void,
    size: usize,
    _committed: bool,
    _arena_ind: c_uint,
) -> bool {
    unsafe {
        libc::munmap(addr, size);
    }
    false
}

#[cfg(target_os = "linux")]
fn bind_to_node(addr: *mut c_void, size: usize, node: NodeId) {
    const MPOL_BIND: libc::c_ulong = 2;
    let mask: u64 = 1u64 << node.0;
    let maxnode: libc::c_ulong = 64;
    unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            size as libc::c_ulong,
            MPOL_BIND,
            &mask as *const u64,
            maxnode,
            0 as libc::c_ulong,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_addr: *mut c_void, _size: usize, _node: NodeId) {}

/// Per-node allocator: an arena whose extent hook maps pages and binds them
/// to a chosen NUMA node. `allocate`/`deallocate` route through the arena
/// with the thread cache disabled, per SPEC_FULL.md §4.C.
pub struct NumaMemoryResource {
    node_id: NodeId,
    arena_id: u32,
    allocation_flags: c_int,
}

impl NumaMemoryResource {
    /// Construct a resource bound to `node_id`. Fails if `node_id` is not a
    /// real node in the discovered topology.
    pub fn new(node_id: NodeId) -> Result<Self> {
        let num_nodes = topology::global().num_nodes();
        if !node_id.is_real(num_nodes) {
            return Err(SchedulerError::InvalidNode { node: node_id, num_nodes });
        }

        let mut arena_id: u32 = 0;
        let mut size = std::mem::size_of::<u32>();
        let name = CString::new("arenas.create").expect("mallctl command name has no interior NUL");
        let rc = unsafe {
            tikv_jemalloc_sys::mallctl(
                name.as_ptr(),
                &mut arena_id as *mut u32 as *mut c_void,
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc != 0 {
            return Err(SchedulerError::ArenaCreationFailed { reason: format!("mallctl errno {rc}") });
        }

        register_arena(arena_id, node_id);

        let hooks = Box::leak(Box::new(ExtentHooks {
            alloc: Some(extent_alloc),
            dalloc: Some(extent_dalloc),
            destroy: std::ptr::null(),
            commit: std::ptr::null(),
            decommit: std::ptr::null(),
            purge_lazy: std::ptr::null(),
            purge_forced: std::ptr::null(),
            split: std::ptr::null(),
            merge: std::ptr::null(),
        }));
        let mut hooks_ptr: *mut ExtentHooks = hooks;

        let command = CString::new(format!("arena.{arena_id}.extent_hooks"))
            .expect("mallctl command name has no interior NUL");
        let rc = unsafe {
            tikv_jemalloc_sys::mallctl(
                command.as_ptr(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut hooks_ptr as *mut *mut ExtentHooks as *mut c_void,
                std::mem::size_of::<*mut ExtentHooks>(),
            )
        };
        if rc != 0 {
            return Err(SchedulerError::ArenaCreationFailed {
                reason: format!("failed to install extent hooks, errno {rc}"),
            });
        }

        let allocation_flags = mallocx_arena(arena_id) | MALLOCX_TCACHE_NONE;

        tracing::debug!(node = %node_id, arena_id, "created NUMA-bound jemalloc arena");

        Ok(Self { node_id, arena_id, allocation_flags })
    }

    /// The node this resource is bound to.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Diagnostic counters for this resource's arena.
    pub fn stats(&self) -> NodeAllocStatsSnapshot {
        let reg = registry().lock();
        let stats = reg.stats.get(&self.arena_id).expect("arena must be registered");
        NodeAllocStatsSnapshot {
            extent_count: stats.extent_count(),
            bytes_allocated: stats.bytes_allocated(),
        }
    }

    /// Allocate `bytes` aligned to at least `alignment`, pinned to this
    /// resource's arena with the thread cache disabled.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> *mut u8 {
        let flags = self.allocation_flags | mallocx_lg_align(alignment);
        let ptr = unsafe { tikv_jemalloc_sys::mallocx(bytes.max(1), flags) };
        assert!(!ptr.is_null(), "arena allocation of {bytes} bytes failed on node {}", self.node_id);
        ptr as *mut u8
    }

    /// Return memory obtained from [`NumaMemoryResource::allocate`].
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this same resource with
    /// the same `bytes`/`alignment`.
    pub unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) {
        let flags = self.allocation_flags | mallocx_lg_align(alignment);
        unsafe {
            tikv_jemalloc_sys::sdallocx(ptr as *mut c_void, bytes.max(1), flags);
        }
    }

    /// Identity comparison: two resources are equal iff they are the same
    /// object.
    pub fn equals(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// Snapshot of [`NodeAllocStats`] returned by [`NumaMemoryResource::stats`].
#[derive(Debug, Clone, Copy)]
pub struct NodeAllocStatsSnapshot {
    /// Extent-hook `alloc` invocations serviced.
    pub extent_count: u64,
    /// Cumulative page-rounded bytes mapped.
    pub bytes_allocated: u64,
}
