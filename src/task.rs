//! Scheduled unit of work (SPEC_FULL.md §4.D).
//!
//! The state lattice is a runtime-checked enum rather than a phantom-typed
//! state: task state transitions are driven by predecessor completion at
//! runtime, not known at compile time, so a phantom-typed state would just
//! push the same runtime checks into unsafe transmutes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::error::{NodeId, TaskId, INVALID_NODE_ID};

/// A task's position in its state lattice. Transitions only ever move
/// forward; a regression is an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskState {
    /// Constructed, not yet handed to the scheduler.
    Created = 0,
    /// Scheduled; waiting for predecessors to finish.
    Scheduled = 1,
    /// All predecessors done; eligible to run.
    Ready = 2,
    /// Currently executing on a worker.
    Running = 3,
    /// Body has run exactly once and returned.
    Done = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Created,
            1 => TaskState::Scheduled,
            2 => TaskState::Ready,
            3 => TaskState::Running,
            4 => TaskState::Done,
            _ => unreachable!("invalid TaskState encoding"),
        }
    }
}

struct Inner {
    id: Mutex<Option<TaskId>>,
    node_id: Mutex<NodeId>,
    state: AtomicU32,
    pending_predecessors: AtomicU32,
    /// Strong forward references: a task's predecessors only reach it
    /// through this list, keeping the task alive as long as anything it
    /// unblocks might still run.
    successors: Mutex<Vec<JobTask>>,
    /// Weak back-references so predecessor/successor form a DAG without a
    /// reference cycle keeping every task in a chain alive forever.
    predecessors: Mutex<Vec<Weak<Inner>>>,
    was_stolen: AtomicBool,
    body: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    done_lock: Mutex<bool>,
    done_cond: Condvar,
}

/// A unit of scheduled work with dependencies and a body.
///
/// Cheap to clone: internally an `Arc`, so the producer, the queue, the
/// executing worker, and any waiter can all hold a handle with lifetime
/// equal to the longest holder, per SPEC_FULL.md §3.
#[derive(Clone)]
pub struct JobTask {
    inner: Arc<Inner>,
}

impl JobTask {
    /// Create a task that runs `body` exactly once, the first time it
    /// transitions into `Done`.
    pub fn new(body: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Mutex::new(None),
                node_id: Mutex::new(INVALID_NODE_ID),
                state: AtomicU32::new(TaskState::Created as u32),
                pending_predecessors: AtomicU32::new(0),
                successors: Mutex::new(Vec::new()),
                predecessors: Mutex::new(Vec::new()),
                was_stolen: AtomicBool::new(false),
                body: Mutex::new(Some(Box::new(body))),
                done_lock: Mutex::new(false),
                done_cond: Condvar::new(),
            }),
        }
    }

    /// Current lattice position.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::Acquire) as u8)
    }

    fn set_state(&self, new: TaskState) {
        let old = self.state();
        debug_assert!(new as u8 >= old as u8, "task state regressed from {old:?} to {new:?}");
        self.inner.state.store(new as u32, Ordering::Release);
    }

    /// Task id, assigned by the scheduler on submission.
    pub fn id(&self) -> Option<TaskId> {
        *self.inner.id.lock()
    }

    pub(crate) fn set_id(&self, id: TaskId) {
        *self.inner.id.lock() = Some(id);
    }

    /// Preferred node, possibly a sentinel.
    pub fn node_id(&self) -> NodeId {
        *self.inner.node_id.lock()
    }

    /// Set the preferred node. Must be called before scheduling.
    pub fn set_node_id(&self, node: NodeId) {
        *self.inner.node_id.lock() = node;
    }

    /// Whether this task was obtained by a worker stealing from a foreign
    /// queue rather than from its home queue.
    pub fn was_stolen(&self) -> bool {
        self.inner.was_stolen.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_stolen(&self) {
        self.inner.was_stolen.store(true, Ordering::Relaxed);
    }

    /// Whether this task already has any predecessor or successor edge.
    /// Grouping (SPEC_FULL.md §4.G) must skip such tasks, since chaining them
    /// further could introduce a cycle.
    pub(crate) fn has_edges(&self) -> bool {
        !self.inner.predecessors.lock().is_empty() || !self.inner.successors.lock().is_empty()
    }

    /// Record `self` as a predecessor of `other`: `other` cannot become
    /// Ready until `self` is Done. Must be called before either task is
    /// scheduled. Panics (debug builds only, per SPEC_FULL.md §4.D) if the
    /// edge would create a cycle.
    pub fn set_as_predecessor_of(&self, other: &JobTask) {
        debug_assert_eq!(self.state(), TaskState::Created, "predecessor edges must be set before scheduling");
        debug_assert_eq!(other.state(), TaskState::Created, "predecessor edges must be set before scheduling");

        #[cfg(debug_assertions)]
        assert!(!would_cycle(other, self), "adding this predecessor edge would create a cycle");

        other.inner.predecessors.lock().push(Arc::downgrade(&self.inner));
        other.inner.pending_predecessors.fetch_add(1, Ordering::AcqRel);
        self.inner.successors.lock().push(other.clone());
    }

    /// True iff Scheduled and every predecessor has finished.
    pub fn is_ready(&self) -> bool {
        self.state() == TaskState::Scheduled
            && self.inner.pending_predecessors.load(Ordering::Acquire) == 0
    }

    /// True iff the task has reached `Done`.
    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    /// Transition Created -> Scheduled with no node preference.
    pub fn schedule_default(&self) {
        self.schedule(INVALID_NODE_ID);
    }

    /// Transition Created -> Scheduled with `node` as the preferred node,
    /// then hand the task to the global scheduler.
    pub fn schedule(&self, node: NodeId) {
        self.mark_scheduled(node);
        crate::scheduler::Scheduler::get()
            .schedule(self.clone(), crate::queue::Priority::Default)
            .expect("JobTask::schedule requires an active scheduler; call Scheduler::get().begin() first");
    }

    /// Set the preferred node and transition Created -> Scheduled, without
    /// handing the task to the scheduler. Used by [`crate::scheduler::Scheduler`]
    /// itself, which performs the id assignment and routing separately.
    pub(crate) fn mark_scheduled(&self, node: NodeId) {
        self.set_node_id(node);
        self.set_state(TaskState::Scheduled);
    }

    /// If ready, transitions Scheduled -> Ready. A no-op if predecessors are
    /// still outstanding; called again when the last one finishes.
    pub(crate) fn try_mark_ready(&self) -> bool {
        if self.is_ready() {
            self.set_state(TaskState::Ready);
            true
        } else {
            false
        }
    }

    /// Run the body exactly once. Transitions Ready -> Running -> Done, then
    /// wakes any successor whose last predecessor just finished, returning
    /// those newly-ready successors so the caller (a [`crate::worker::Worker`])
    /// can enqueue them.
    pub fn execute(&self) -> Vec<JobTask> {
        self.set_state(TaskState::Running);

        let body = self
            .inner
            .body
            .lock()
            .take()
            .expect("task body invoked more than once");
        body();

        self.set_state(TaskState::Done);
        {
            let mut done = self.inner.done_lock.lock();
            *done = true;
            self.inner.done_cond.notify_all();
        }

        let mut newly_ready = Vec::new();
        for successor in self.inner.successors.lock().iter() {
            let remaining = successor.inner.pending_predecessors.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 && successor.try_mark_ready() {
                newly_ready.push(successor.clone());
            }
        }
        newly_ready
    }

    /// Block the calling thread until this task reaches `Done`.
    ///
    /// Re-entrancy: calling this from inside a worker's own execution is
    /// routed through [`crate::worker::Worker::wait_for_tasks`] so the
    /// waiting worker drains other work instead of parking; see
    /// [`crate::scheduler::Scheduler::wait_for_tasks`].
    pub fn join(&self) {
        let mut done = self.inner.done_lock.lock();
        while !*done {
            self.inner.done_cond.wait(&mut done);
        }
    }
}

#[cfg(debug_assertions)]
fn would_cycle(from: &JobTask, to: &JobTask) -> bool {
    // Bounded DFS over `from`'s successors looking for `to`: if found, adding
    // `to -> from` (to is a predecessor of from) would close a cycle.
    let target = Arc::as_ptr(&to.inner);
    let mut stack = vec![from.clone()];
    let mut seen: HashSet<*const Inner> = HashSet::new();
    while let Some(task) = stack.pop() {
        let ptr = Arc::as_ptr(&task.inner);
        if ptr == target {
            return true;
        }
        if !seen.insert(ptr) {
            continue;
        }
        stack.extend(task.inner.successors.lock().iter().cloned());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    #[test]
    fn fresh_task_starts_created() {
        let task = JobTask::new(|| {});
        assert_eq!(task.state(), TaskState::Created);
        assert!(!task.is_ready());
    }

    #[test]
    fn schedule_without_predecessors_is_immediately_ready() {
        let task = JobTask::new(|| {});
        task.set_state_for_test(TaskState::Scheduled);
        assert!(task.is_ready());
    }

    #[test]
    fn predecessor_must_finish_before_successor_ready() {
        let ran = Arc::new(StdAtomicU32::new(0));
        let ran2 = ran.clone();
        let a = JobTask::new(move || {
            ran.store(1, std::sync::atomic::Ordering::SeqCst);
        });
        let b = JobTask::new(move || {
            assert_eq!(ran2.load(std::sync::atomic::Ordering::SeqCst), 1);
        });
        a.set_as_predecessor_of(&b);

        a.set_state_for_test(TaskState::Scheduled);
        b.set_state_for_test(TaskState::Scheduled);

        assert!(a.is_ready());
        assert!(!b.is_ready());

        a.set_state_for_test(TaskState::Ready);
        let newly_ready = a.execute();
        assert_eq!(newly_ready.len(), 1);
        assert!(b.is_ready());

        b.set_state_for_test(TaskState::Ready);
        b.execute();
        assert!(b.is_done());
    }

    #[test]
    fn body_runs_exactly_once() {
        let count = Arc::new(StdAtomicU32::new(0));
        let count2 = count.clone();
        let task = JobTask::new(move || {
            count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        task.set_state_for_test(TaskState::Scheduled);
        task.set_state_for_test(TaskState::Ready);
        task.execute();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "regressed")]
    fn state_regression_panics() {
        let task = JobTask::new(|| {});
        task.set_state_for_test(TaskState::Scheduled);
        task.set_state_for_test(TaskState::Ready);
        task.execute();
        // Done -> Running is a regression; executing an already-finished
        // task is unreachable through the public API but the lattice check
        // still catches it defensively.
        task.set_state_for_test(TaskState::Running);
    }

    impl JobTask {
        fn set_state_for_test(&self, state: TaskState) {
            self.set_state(state);
        }
    }
}
