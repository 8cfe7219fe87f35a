//! End-to-end scenarios run against a real `Scheduler`, real OS threads, and
//! whatever NUMA topology the host actually reports (falling back to a
//! single node on hosts without NUMA). Scenarios that require a specific,
//! hand-crafted topology or distance matrix (steal-order-under-distance,
//! priority draining with a single pinned worker) are instead exercised as
//! unit tests alongside the modules that own the relevant private state,
//! since `Scheduler::get()` always discovers the real host topology and
//! `Worker`/`TaskQueue::new` construction is crate-private.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

use numa_scheduler::{JobTask, NodeId, NumaMemoryResource, Priority, Scheduler, TaskQueue, Worker};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
    });
}

/// `Scheduler::get()` is a process-wide singleton; serialize every test that
/// brackets a `begin()`/`finish()` pair so they don't stomp on each other.
static SCHEDULER_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn steal_order_is_self_first_and_distance_non_decreasing_on_the_live_topology() {
    let _guard = SCHEDULER_LOCK.lock().unwrap();
    let topo = numa_scheduler::topology();
    let scheduler = Scheduler::get();
    scheduler.begin();

    for n in 0..topo.num_nodes() as u32 {
        let row = scheduler.ordered_queue_ids(NodeId(n));
        assert_eq!(row[0], NodeId(n), "a node's own id must head its steal order");
        let distances: Vec<u32> = row.iter().map(|&id| topo.distances().at(n as usize, id.index())).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]), "steal order must be non-decreasing in distance");
    }

    assert_eq!(scheduler.queues().len(), topo.num_nodes());
    assert_eq!(scheduler.workers().len(), topo.all_cpus().count());

    scheduler.finish();
}

#[test]
fn linear_chain_executes_in_order() {
    init_tracing();
    let _guard = SCHEDULER_LOCK.lock().unwrap();
    let scheduler = Scheduler::get();
    scheduler.begin();

    let order = std::sync::Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for i in 0..10u32 {
        let order = order.clone();
        let task = JobTask::new(move || order.lock().unwrap().push(i));
        task.set_node_id(NodeId(0));
        tasks.push(task);
    }
    for pair in tasks.windows(2) {
        pair[0].set_as_predecessor_of(&pair[1]);
    }

    scheduler.schedule_and_wait(&tasks).unwrap();
    scheduler.finish();

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn independent_fan_out_is_capped_at_group_size() {
    init_tracing();
    let _guard = SCHEDULER_LOCK.lock().unwrap();
    let scheduler = Scheduler::get();
    scheduler.begin();
    let group_size = scheduler.config().group_size() as i64;

    let concurrent = std::sync::Arc::new(AtomicI64::new(0));
    let max_concurrent = std::sync::Arc::new(AtomicI64::new(0));
    let completed = std::sync::Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..240 {
        let concurrent = concurrent.clone();
        let max_concurrent = max_concurrent.clone();
        let completed = completed.clone();
        let task = JobTask::new(move || {
            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            max_concurrent.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(200));
            concurrent.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);
        });
        task.set_node_id(NodeId(0));
        tasks.push(task);
    }

    scheduler.schedule_and_wait(&tasks).unwrap();
    scheduler.finish();

    assert_eq!(completed.load(Ordering::SeqCst), 240);
    assert!(
        max_concurrent.load(Ordering::SeqCst) <= group_size,
        "observed {} concurrent chains, expected at most group_size {}",
        max_concurrent.load(Ordering::SeqCst),
        group_size
    );
}

#[test]
fn priority_drains_high_before_default_through_the_public_queue_api() {
    let queue = TaskQueue::new(NodeId(0));
    let order = std::sync::Arc::new(Mutex::new(Vec::new()));

    let push = |queue: &TaskQueue, order: &std::sync::Arc<Mutex<Vec<&'static str>>>, name: &'static str, p: Priority| {
        let order = order.clone();
        queue.push(JobTask::new(move || order.lock().unwrap().push(name)), p);
    };
    push(&queue, &order, "d0", Priority::Default);
    push(&queue, &order, "d1", Priority::Default);
    push(&queue, &order, "d2", Priority::Default);
    push(&queue, &order, "h0", Priority::High);
    push(&queue, &order, "h1", Priority::High);
    push(&queue, &order, "h2", Priority::High);

    while let Some(task) = queue.try_pop() {
        task.execute();
    }

    assert_eq!(*order.lock().unwrap(), vec!["h0", "h1", "h2", "d0", "d1", "d2"]);
}

#[test]
fn a_real_preferred_node_is_honored() {
    init_tracing();
    let _guard = SCHEDULER_LOCK.lock().unwrap();
    let scheduler = Scheduler::get();
    scheduler.begin();

    let observed = std::sync::Arc::new(Mutex::new(None));
    let observed2 = observed.clone();
    let task = JobTask::new(move || {
        *observed2.lock().unwrap() = Worker::current().map(|w| w.node_id());
    });
    task.set_node_id(NodeId(0));

    scheduler.schedule_and_wait(std::slice::from_ref(&task)).unwrap();
    scheduler.finish();

    assert_eq!(*observed.lock().unwrap(), Some(NodeId(0)));
}

#[test]
fn finished_count_matches_scheduled_count_for_a_mixed_batch() {
    init_tracing();
    let _guard = SCHEDULER_LOCK.lock().unwrap();
    let scheduler = Scheduler::get();
    scheduler.begin();

    let completed = std::sync::Arc::new(AtomicU32::new(0));
    let mut tasks = Vec::new();
    for i in 0..50u32 {
        let completed = completed.clone();
        let task = JobTask::new(move || {
            completed.fetch_add(1, Ordering::SeqCst);
        });
        task.set_node_id(if i % 2 == 0 { NodeId(0) } else { numa_scheduler::INVALID_NODE_ID });
        tasks.push(task);
    }

    // `scheduled` accumulates for the process lifetime (SchedulerStatsSnapshot
    // docs), so compare a before/after delta rather than an absolute value --
    // other tests in this binary share the same `Scheduler::get()` singleton.
    let before = scheduler.stats().scheduled;
    scheduler.schedule_tasks(&tasks).unwrap();
    scheduler.wait_for_tasks(&tasks);
    let after = scheduler.stats().scheduled;
    scheduler.finish();

    assert_eq!(completed.load(Ordering::SeqCst), 50);
    assert_eq!(after - before, 50);
    assert!(tasks.iter().all(|t| t.is_done()));
}

#[test]
fn arena_binding_reads_back_via_the_os_numa_interface() {
    let resource = NumaMemoryResource::new(NodeId(0)).expect("node 0 always exists");
    let bytes = 1usize << 20;
    let ptr = resource.allocate(bytes, 64);
    assert!(!ptr.is_null());

    if let Some(node) = read_back_numa_node(ptr as usize) {
        assert_eq!(node, 0, "page should be bound to node 0");
    }
    // On hosts with no NUMA support (or without /proc), the readback is
    // `None` and the binding syscall was a documented no-op; the arena
    // registry/hook wiring itself is still exercised above.

    unsafe { resource.deallocate(ptr, bytes, 64) };
}

/// Parse `/proc/self/numa_maps` for the mapping that contains `addr` and
/// return the node id its pages were actually allocated on (the `N<id>=`
/// token), the standard way to read NUMA placement back from the OS on
/// Linux.
#[cfg(target_os = "linux")]
fn read_back_numa_node(addr: usize) -> Option<u32> {
    let contents = std::fs::read_to_string("/proc/self/numa_maps").ok()?;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let start = usize::from_str_radix(fields.next()?.trim_start_matches("0x"), 16).ok()?;
        if start != addr {
            continue;
        }
        for field in fields {
            if let Some(rest) = field.strip_prefix('N') {
                if let Some((node, _)) = rest.split_once('=') {
                    return node.parse().ok();
                }
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_back_numa_node(_addr: usize) -> Option<u32> {
    None
}
