//! Per-node task queue (SPEC_FULL.md §4.E).
//!
//! Two FIFO lists behind a `parking_lot::Mutex`, one per priority level, with
//! a `Condvar` for the blocking pop and a [`crate::cache_aligned::CacheAlignedCounter`]
//! tracking the load estimate so readers never need to lock either list just
//! to size-check it.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cache_aligned::CacheAlignedCounter;
use crate::error::NodeId;
use crate::task::JobTask;

/// Scheduling priority within a single node's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Normal priority; the common case.
    Default,
    /// Drained before any `Default`-priority task.
    High,
}

struct Lists {
    high: VecDeque<JobTask>,
    default: VecDeque<JobTask>,
}

/// A single NUMA node's task queue. Multi-producer/multi-consumer: any
/// worker may push (when a successor becomes ready) and any worker may pop
/// (locally or while stealing).
pub struct TaskQueue {
    node_id: NodeId,
    lists: Mutex<Lists>,
    not_empty: Condvar,
    load: CacheAlignedCounter,
    shutdown: CacheAlignedCounter,
}

impl TaskQueue {
    /// Create an empty queue for `node_id`.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            lists: Mutex::new(Lists { high: VecDeque::new(), default: VecDeque::new() }),
            not_empty: Condvar::new(),
            load: CacheAlignedCounter::new(0),
            shutdown: CacheAlignedCounter::new(0),
        }
    }

    /// The node this queue is homed to.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Append `task` to the `priority` list. FIFO per producer; cross
    /// producer order is unspecified.
    pub fn push(&self, task: JobTask, priority: Priority) {
        let mut lists = self.lists.lock();
        match priority {
            Priority::High => lists.high.push_back(task),
            Priority::Default => lists.default.push_back(task),
        }
        self.load.increment();
        self.not_empty.notify_one();
    }

    /// Pop a task without blocking: High priority first, then Default, each
    /// FIFO.
    pub fn try_pop(&self) -> Option<JobTask> {
        let mut lists = self.lists.lock();
        let task = lists.high.pop_front().or_else(|| lists.default.pop_front());
        if task.is_some() {
            self.load.decrement();
        }
        task
    }

    /// Pop a task, waiting with brief yielding until one is available or
    /// [`TaskQueue::signal_shutdown`] has been called and the queue drained.
    pub fn pop_blocking(&self) -> Option<JobTask> {
        let mut lists = self.lists.lock();
        loop {
            if let Some(task) = lists.high.pop_front().or_else(|| lists.default.pop_front()) {
                self.load.decrement();
                return Some(task);
            }
            if self.shutdown.get() != 0 {
                return None;
            }
            self.not_empty.wait_for(&mut lists, Duration::from_millis(5));
        }
    }

    /// Approximate number of queued tasks across both priorities. May be
    /// stale but is monotonic with respect to pushes observed between
    /// concurrent pops.
    pub fn estimate_load(&self) -> u64 {
        self.load.get()
    }

    /// Best-effort emptiness probe. Callers must tolerate transient
    /// false-negatives near concurrent pops.
    pub fn empty(&self) -> bool {
        let lists = self.lists.lock();
        lists.high.is_empty() && lists.default.is_empty()
    }

    /// Wake any thread parked in [`TaskQueue::pop_blocking`] so it can
    /// observe shutdown once the queue is drained.
    pub fn signal_shutdown(&self) {
        self.shutdown.add(1);
        self.not_empty.notify_all();
    }
}
