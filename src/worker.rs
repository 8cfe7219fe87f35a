//! Worker thread (SPEC_FULL.md §4.F).
//!
//! One OS thread per CPU, pinned via `sched_setaffinity` to a single CPU
//! rather than a whole node's mask.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_utils::Backoff;

use crate::cache_aligned::CacheAlignedCounter;
use crate::error::NodeId;
use crate::queue::TaskQueue;
use crate::task::JobTask;
use crate::topology::NodeMatrix;

thread_local! {
    static CURRENT: RefCell<Option<Weak<Worker>>> = const { RefCell::new(None) };
}

/// A worker thread pinned to a single CPU, draining its home queue and
/// stealing from foreign queues in distance order when idle.
pub struct Worker {
    id: u32,
    cpu_id: usize,
    node_id: NodeId,
    queue: Arc<TaskQueue>,
    all_queues: Arc<Vec<Arc<TaskQueue>>>,
    steal_order: Arc<NodeMatrix>,
    finished_tasks: CacheAlignedCounter,
    stolen_tasks: CacheAlignedCounter,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub(crate) fn new(
        id: u32,
        cpu_id: usize,
        queue: Arc<TaskQueue>,
        all_queues: Arc<Vec<Arc<TaskQueue>>>,
        steal_order: Arc<NodeMatrix>,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let node_id = queue.node_id();
        Arc::new(Self {
            id,
            cpu_id,
            node_id,
            queue,
            all_queues,
            steal_order,
            finished_tasks: CacheAlignedCounter::new(0),
            stolen_tasks: CacheAlignedCounter::new(0),
            shutdown,
        })
    }

    /// Spawn this worker's OS thread, pin it to `cpu_id`, and start the main
    /// loop. Returns a join handle the scheduler keeps to join at shutdown.
    pub(crate) fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = self.clone();
        std::thread::Builder::new()
            .name(format!("numa-worker-{}", worker.id))
            .spawn(move || {
                pin_to_cpu(worker.cpu_id);
                CURRENT.with(|c| *c.borrow_mut() = Some(Arc::downgrade(&worker)));
                worker.run();
                CURRENT.with(|c| *c.borrow_mut() = None);
            })
            .expect("failed to spawn worker thread")
    }

    /// The active worker on the calling thread, or `None` outside a worker.
    pub fn current() -> Option<Arc<Worker>> {
        CURRENT.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// The node this worker (and its home queue) is bound to.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// This worker's home queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Number of tasks this worker has completed.
    pub fn finished_tasks(&self) -> u64 {
        self.finished_tasks.get()
    }

    /// Number of those that were stolen from a foreign queue.
    pub fn stolen_tasks(&self) -> u64 {
        self.stolen_tasks.get()
    }

    fn run(&self) {
        let backoff = Backoff::new();
        loop {
            if let Some(task) = self.take_task() {
                backoff.reset();
                self.execute(task);
                continue;
            }

            if self.shutdown.load(Ordering::Acquire) && self.all_queues.iter().all(|q| q.empty()) {
                return;
            }

            // Step 3 of the main loop (SPEC_FULL.md §4.F): briefly yield or
            // sleep, then retry from the top. `pop_blocking` already
            // implements "wait with brief yielding" on the local queue, so
            // it doubles as that sleep; if it wakes up with a task (a
            // producer pushed while we were waiting) we run it immediately
            // rather than looping back through an empty steal scan first.
            if let Some(task) = self.queue.pop_blocking() {
                self.execute(task);
            }
            backoff.spin();
        }
    }

    /// Try the local queue, then foreign queues in distance order, never
    /// blocking. A task obtained from a foreign queue is marked stolen.
    fn take_task(&self) -> Option<JobTask> {
        if let Some(task) = self.queue.try_pop() {
            return Some(task);
        }
        for &node in self.steal_order.row(self.node_id).iter().skip(1) {
            let queue = &self.all_queues[node.index()];
            if let Some(task) = queue.try_pop() {
                task.mark_stolen();
                self.stolen_tasks.increment();
                tracing::trace!(worker = self.id, from_node = %node, "stole a task");
                return Some(task);
            }
        }
        None
    }

    fn execute(&self, task: JobTask) {
        let ready_successors = task.execute();
        self.finished_tasks.increment();
        for successor in ready_successors {
            crate::scheduler::Scheduler::get().enqueue_successor(successor);
        }
    }

    /// Re-entrant wait: drain local and foreign work until every task in
    /// `tasks` is Done, instead of parking the thread. Used when
    /// `Scheduler::wait_for_tasks` is called from inside a running task.
    pub(crate) fn wait_for_tasks(&self, tasks: &[JobTask]) {
        let backoff = Backoff::new();
        loop {
            if tasks.iter().all(JobTask::is_done) {
                return;
            }
            if let Some(task) = self.take_task() {
                backoff.reset();
                self.execute(task);
                continue;
            }
            backoff.snooze();
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu_id: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu_id: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeId;
    use crate::topology::{sort_relative, DistanceMatrix};
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    fn single_node_fixture() -> (Arc<Worker>, Arc<Vec<Arc<TaskQueue>>>, JoinHandle<()>) {
        let queues = Arc::new(vec![Arc::new(TaskQueue::new(NodeId(0)))]);
        let distances = DistanceMatrix::uniform(1, 10);
        let order = Arc::new(sort_relative(&distances));
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(0, 0, queues[0].clone(), queues.clone(), order, shutdown);
        let handle = worker.start();
        (worker, queues, handle)
    }

    #[test]
    fn current_is_none_outside_a_worker() {
        assert!(Worker::current().is_none());
    }

    #[test]
    fn worker_drains_local_queue_and_shuts_down() {
        let (worker, queues, handle) = single_node_fixture();
        let ran = Arc::new(StdAtomicU64::new(0));
        let ran2 = ran.clone();
        let task = JobTask::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        task.set_node_id(NodeId(0));
        // Bypass the global Scheduler singleton: push directly for this
        // isolated worker-loop test.
        queues[0].push(task, crate::queue::Priority::Default);

        // Give the worker a moment to drain, then shut it down.
        std::thread::sleep(std::time::Duration::from_millis(30));
        worker.shutdown.store(true, Ordering::Release);
        queues[0].signal_shutdown();
        handle.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(worker.finished_tasks(), 1);
    }
}
