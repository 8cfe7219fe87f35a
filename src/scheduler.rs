//! Topology-aware dispatcher (SPEC_FULL.md §4.G).
//!
//! Singleton facade over the per-node queues and workers: routing and
//! grouping logic, plus an `EnvBuilder`-style config builder.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;

use crate::cache_aligned::CacheAlignedCounter;
use crate::error::{NodeId, Result, SchedulerError, TaskId, INVALID_NODE_ID};
use crate::queue::{Priority, TaskQueue};
use crate::task::{JobTask, TaskState};
use crate::topology::{self, sort_relative, NodeMatrix};
use crate::worker::Worker;

/// Tunable knobs, overridable via environment variables read once at
/// [`Scheduler::get`] construction, per SPEC_FULL.md §9.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    group_size: u32,
    page_size: usize,
    steal_backoff_spins: u32,
}

impl SchedulerConfig {
    /// Start building a config from the builder defaults.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// `G`: the grouping fan-out cap per node (§4.G).
    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    /// Extent rounding granularity recorded for diagnostics; the extent hooks
    /// in `memory.rs` are free functions and always round to
    /// [`crate::memory::PAGE_SIZE`] regardless of this value.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Spin budget before a worker's steal loop falls back to
    /// `pop_blocking`. Informational: `crossbeam_utils::Backoff` manages its
    /// own spin/yield escalation and does not take an external budget.
    pub fn steal_backoff_spins(&self) -> u32 {
        self.steal_backoff_spins
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            group_size: env_override("NUMA_SCHEDULER_GROUP_SIZE", 8),
            page_size: env_override("NUMA_SCHEDULER_PAGE_SIZE", crate::memory::PAGE_SIZE),
            steal_backoff_spins: 64,
        }
    }
}

fn env_override<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "failed to parse env override, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Builder for [`SchedulerConfig`]; unset fields fall back to
/// [`SchedulerConfig::default`] (builder defaults, themselves overridable by
/// environment variables).
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerConfigBuilder {
    group_size: Option<u32>,
    page_size: Option<usize>,
    steal_backoff_spins: Option<u32>,
}

impl SchedulerConfigBuilder {
    /// Set `G`, the per-node grouping fan-out cap.
    pub fn group_size(mut self, group_size: u32) -> Self {
        self.group_size = Some(group_size);
        self
    }

    /// Set the extent rounding granularity recorded for diagnostics.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Set the worker steal-loop spin budget.
    pub fn steal_backoff(mut self, spins: u32) -> Self {
        self.steal_backoff_spins = Some(spins);
        self
    }

    /// Finish building, filling any unset field from the defaults.
    pub fn build(self) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        SchedulerConfig {
            group_size: self.group_size.unwrap_or(defaults.group_size),
            page_size: self.page_size.unwrap_or(defaults.page_size),
            steal_backoff_spins: self.steal_backoff_spins.unwrap_or(defaults.steal_backoff_spins),
        }
    }
}

#[derive(Default)]
struct SchedulerStats {
    scheduled: CacheAlignedCounter,
    correctly_routed: CacheAlignedCounter,
    no_preference: CacheAlignedCounter,
}

/// Snapshot of the scheduler's advisory observability counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStatsSnapshot {
    /// Tasks handed to [`Scheduler::schedule`].
    pub scheduled: u64,
    /// Routed to their preferred node.
    pub correctly_routed: u64,
    /// Routed with no node preference (in-worker or least-loaded fallback).
    pub no_preference: u64,
    /// Stolen from a foreign queue, summed across active workers.
    pub stolen: u64,
}

struct ActiveState {
    queues: Vec<Arc<TaskQueue>>,
    workers: Vec<Arc<Worker>>,
    steal_order: Arc<NodeMatrix>,
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

/// Process-wide dispatcher: one queue and one-worker-per-CPU per discovered
/// NUMA node. Construction (via [`Scheduler::get`]) does not imply the
/// scheduler is active; [`Scheduler::begin`]/[`Scheduler::finish`] bracket
/// the window during which queues and workers exist.
pub struct Scheduler {
    config: SchedulerConfig,
    active: AtomicBool,
    next_task_id: AtomicU64,
    state: RwLock<Option<ActiveState>>,
    stats: SchedulerStats,
}

static GLOBAL: OnceLock<Scheduler> = OnceLock::new();

impl Scheduler {
    /// The process-wide scheduler instance, lazily constructed on first
    /// access. Construction alone does not start any threads.
    pub fn get() -> &'static Scheduler {
        GLOBAL.get_or_init(|| Scheduler {
            config: SchedulerConfig::default(),
            active: AtomicBool::new(false),
            next_task_id: AtomicU64::new(0),
            state: RwLock::new(None),
            stats: SchedulerStats::default(),
        })
    }

    /// The config this scheduler was constructed with.
    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Whether the scheduler is between a `begin()`/`finish()` pair.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// One-shot start: one queue per discovered node, one worker per CPU
    /// pinned to its node's queue, the node priority matrix computed once.
    /// Panics if already active.
    pub fn begin(&self) {
        let mut guard = self.state.write();
        assert!(guard.is_none(), "Scheduler::begin called while already active");

        let topo = topology::global();
        let num_nodes = topo.num_nodes();
        let queues: Vec<Arc<TaskQueue>> =
            (0..num_nodes).map(|n| Arc::new(TaskQueue::new(NodeId(n as u32)))).collect();
        let all_queues = Arc::new(queues.clone());
        let steal_order = Arc::new(sort_relative(topo.distances()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::new();
        let mut handles = Vec::new();
        for (worker_id, (node, cpu)) in topo.all_cpus().enumerate() {
            let queue = queues[node.index()].clone();
            let worker = Worker::new(
                worker_id as u32,
                cpu,
                queue,
                all_queues.clone(),
                steal_order.clone(),
                shutdown.clone(),
            );
            handles.push(worker.start());
            workers.push(worker);
        }

        // Task ids restart each begin/finish cycle; the observability
        // counters in `stats` accumulate for the process lifetime.
        self.next_task_id.store(0, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
        *guard = Some(ActiveState { queues, workers, steal_order, handles, shutdown });
    }

    /// This session's per-node queues, in node order.
    pub fn queues(&self) -> Vec<Arc<TaskQueue>> {
        let guard = self.state.read();
        let state = guard.as_ref().expect("Scheduler::queues called while the scheduler is not active");
        state.queues.clone()
    }

    /// This session's workers, one per pinned CPU.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        let guard = self.state.read();
        let state = guard.as_ref().expect("Scheduler::workers called while the scheduler is not active");
        state.workers.clone()
    }

    /// The steal order for `node`: `ordered_queue_ids(node)[0] == node`,
    /// non-decreasing in distance thereafter. The same order workers scan in
    /// [`crate::worker::Worker::take_task`].
    pub fn ordered_queue_ids(&self, node: NodeId) -> Vec<NodeId> {
        let guard = self.state.read();
        let state = guard.as_ref().expect("Scheduler::ordered_queue_ids called while the scheduler is not active");
        state.steal_order.row(node).to_vec()
    }

    /// Schedule a single task: assigns a fresh id, and either enqueues it
    /// immediately (if it has no outstanding predecessors) or leaves it for a
    /// completing predecessor to enqueue later.
    pub fn schedule(&self, task: JobTask, priority: Priority) -> Result<()> {
        if !self.active() {
            return Err(SchedulerError::NotActive);
        }
        if task.state() == TaskState::Created {
            // Preserve whatever preferred node the caller already set (the
            // `Inner::new` default is `INVALID_NODE_ID`, meaning "no
            // preference"); only the state transition is missing here.
            task.mark_scheduled(task.node_id());
        }
        task.set_id(TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed)));
        self.stats.scheduled.increment();

        if task.is_ready() {
            self.enqueue(task, priority);
        }
        Ok(())
    }

    /// [`Scheduler::schedule`] over a batch, in order.
    pub fn schedule_tasks(&self, batch: &[JobTask]) -> Result<()> {
        for task in batch {
            self.schedule(task.clone(), Priority::Default)?;
        }
        Ok(())
    }

    /// Apply the grouping pass using `preferred_nodes` as each task's
    /// intended node, schedule every pair, then wait for the whole batch.
    pub fn schedule_on_preferred_nodes_and_wait(
        &self,
        batch: &[JobTask],
        preferred_nodes: &[NodeId],
    ) -> Result<()> {
        assert_eq!(batch.len(), preferred_nodes.len(), "batch and preferred_nodes must have equal length");
        let pairs: Vec<(JobTask, NodeId)> =
            batch.iter().cloned().zip(preferred_nodes.iter().copied()).collect();
        self.apply_grouping(&pairs);
        for (task, node) in &pairs {
            task.mark_scheduled(*node);
            self.schedule(task.clone(), Priority::Default)?;
        }
        self.wait_for_tasks(batch);
        Ok(())
    }

    /// Apply the grouping pass using each task's already-set preferred node,
    /// schedule the batch, then wait for it.
    pub fn schedule_and_wait(&self, batch: &[JobTask]) -> Result<()> {
        let pairs: Vec<(JobTask, NodeId)> = batch.iter().map(|t| (t.clone(), t.node_id())).collect();
        self.apply_grouping(&pairs);
        self.schedule_tasks(batch)?;
        self.wait_for_tasks(batch);
        Ok(())
    }

    /// Block until every task in `batch` is Done. From inside a worker this
    /// drains other work cooperatively instead of parking the thread.
    pub fn wait_for_tasks(&self, batch: &[JobTask]) {
        debug_assert!(
            batch.iter().all(|t| t.state() >= TaskState::Scheduled),
            "wait_for_tasks requires every task to already be scheduled"
        );
        match Worker::current() {
            Some(worker) => worker.wait_for_tasks(batch),
            None => batch.iter().for_each(JobTask::join),
        }
    }

    /// Drain: spin until every issued task has finished, verify every queue
    /// is empty, deactivate, and join every worker thread. Panics if a queue
    /// fails to drain within 1000 short sleeps (SPEC_FULL.md §7).
    pub fn finish(&self) {
        let issued = self.next_task_id.load(Ordering::Acquire);
        {
            let guard = self.state.read();
            let state = guard.as_ref().expect("Scheduler::finish called without a matching begin()");

            loop {
                let finished: u64 = state.workers.iter().map(|w| w.finished_tasks()).sum();
                if finished >= issued {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }

            for queue in &state.queues {
                let mut attempts = 0u32;
                while !queue.empty() {
                    attempts += 1;
                    if attempts > 1000 {
                        panic!(
                            "queue for node {} failed to drain before finish() (load {})",
                            queue.node_id(),
                            queue.estimate_load()
                        );
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }

        self.active.store(false, Ordering::Release);

        let state = self
            .state
            .write()
            .take()
            .expect("Scheduler::finish called without a matching begin()");
        state.shutdown.store(true, Ordering::Release);
        for queue in &state.queues {
            queue.signal_shutdown();
        }
        let stolen: u64 = state.workers.iter().map(|w| w.stolen_tasks()).sum();
        for handle in state.handles {
            let _ = handle.join();
        }

        tracing::info!(
            scheduled = self.stats.scheduled.get(),
            correctly_routed = self.stats.correctly_routed.get(),
            no_preference = self.stats.no_preference.get(),
            stolen,
            "scheduler finished"
        );
    }

    /// Snapshot of the observability counters. `stolen` is summed across
    /// currently active workers and reads zero outside `begin()`/`finish()`.
    pub fn stats(&self) -> SchedulerStatsSnapshot {
        let stolen = self
            .state
            .read()
            .as_ref()
            .map(|s| s.workers.iter().map(|w| w.stolen_tasks()).sum())
            .unwrap_or(0);
        SchedulerStatsSnapshot {
            scheduled: self.stats.scheduled.get(),
            correctly_routed: self.stats.correctly_routed.get(),
            no_preference: self.stats.no_preference.get(),
            stolen,
        }
    }

    /// Enqueue a successor a worker just marked Ready, per the same routing
    /// policy `schedule` uses. Called from [`crate::worker::Worker::execute`];
    /// the successor already has its id and state set, so it bypasses
    /// [`Scheduler::schedule`]'s bookkeeping.
    pub(crate) fn enqueue_successor(&self, task: JobTask) {
        self.enqueue(task, Priority::Default);
    }

    fn enqueue(&self, task: JobTask, priority: Priority) {
        let guard = self.state.read();
        let state = guard.as_ref().expect("enqueue called while the scheduler is not active");
        let index = self.determine_queue(task.node_id(), state);
        state.queues[index].push(task, priority);
    }

    fn determine_queue(&self, preferred: NodeId, state: &ActiveState) -> usize {
        let workers_per_node =
            if state.queues.is_empty() { 0 } else { state.workers.len() / state.queues.len() };
        self.determine_queue_policy(preferred, &state.queues, workers_per_node)
    }

    /// Routing policy, SPEC_FULL.md §4.G:
    /// 1. a single queue short-circuits to it;
    /// 2. a real preferred node wins outright;
    /// 3. inside a worker with no preference, stay on that worker's node;
    /// 4. otherwise the least-loaded queue, preferring node 0 on ties, with a
    ///    short-circuit when node 0's load is already below the per-node
    ///    worker count.
    fn determine_queue_policy(&self, preferred: NodeId, queues: &[Arc<TaskQueue>], workers_per_node: usize) -> usize {
        if queues.len() == 1 {
            return 0;
        }
        if preferred.is_real(queues.len()) {
            self.stats.correctly_routed.increment();
            return preferred.index();
        }
        self.stats.no_preference.increment();
        if let Some(worker) = Worker::current() {
            if worker.node_id().is_real(queues.len()) {
                return worker.node_id().index();
            }
        }
        if queues[0].estimate_load() < workers_per_node as u64 {
            return 0;
        }
        queues
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| q.estimate_load())
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn apply_grouping(&self, pairs: &[(JobTask, NodeId)]) {
        let num_nodes = topology::global().num_nodes();
        let numa_aware = !pairs.is_empty() && pairs.iter().all(|(_, node)| node.is_real(num_nodes));
        if numa_aware {
            self.group_numa_aware(pairs, num_nodes);
        } else {
            self.group_default(pairs);
        }
    }

    /// `group = G * node + (round_robin[node] mod G)`. The round-robin
    /// counters and slot table are local to this call -- fresh for every
    /// batch, never carried across calls or `begin`/`finish` cycles -- so
    /// grouping is a pure function of `pairs` and stays idempotent. If any
    /// task already has a predecessor or successor edge, the whole pass
    /// aborts without touching anything (chaining an already-edged task
    /// further could close a cycle).
    fn group_numa_aware(&self, pairs: &[(JobTask, NodeId)], num_nodes: usize) {
        let g = self.config.group_size().max(1) as usize;
        let mut round_robin = vec![0usize; num_nodes];
        let mut slots: Vec<Option<JobTask>> = vec![None; g * num_nodes];
        for (task, node) in pairs {
            if task.has_edges() {
                return;
            }
            let node_index = node.index();
            let slot = g * node_index + (round_robin[node_index] % g);
            round_robin[node_index] = round_robin[node_index].wrapping_add(1);
            if let Some(prior) = slots[slot].replace(task.clone()) {
                task.set_as_predecessor_of(&prior);
            }
        }
    }

    /// Same chaining idea with a single round-robin over `G` groups, local to
    /// this call. Debug builds assert every task shares a preferred node.
    fn group_default(&self, pairs: &[(JobTask, NodeId)]) {
        let g = self.config.group_size().max(1) as usize;
        debug_assert!(
            pairs.windows(2).all(|w| w[0].1 == w[1].1),
            "default grouping requires every task to share a preferred node"
        );
        let mut round_robin = 0usize;
        let mut slots: Vec<Option<JobTask>> = vec![None; g];
        for (task, _) in pairs {
            if task.has_edges() {
                return;
            }
            let slot = round_robin % g;
            round_robin = round_robin.wrapping_add(1);
            if let Some(prior) = slots[slot].replace(task.clone()) {
                task.set_as_predecessor_of(&prior);
            }
        }
    }
}
