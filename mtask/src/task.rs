// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub(crate) mod state;

use crate::affinity::AffinitySet;
use crate::error::{CODE_SUCCESS, Error, Status};
use crate::handle::{GroupHandle, QueueHandle, TaskHandle};
use crate::loom::sync::atomic::{AtomicU32, Ordering};
use crate::node::Node;
use crate::park::Gate;
use crate::registry::{ActionFn, JobId};
use core::any::Any;
use core::fmt;
use std::sync::Arc;

pub(crate) use state::{StartRunAction, State};

/// Callback invoked after a task's action has returned and its completion
/// has been signalled.
pub type CompletionFn = dyn Fn(TaskHandle, Status) + Send + Sync;

/// One scheduled execution of a job.
///
/// Descriptors are pooled: the hot fields (state, status, instance counters)
/// are atomics, everything set once per submission sits behind a short
/// spinlock. A descriptor is recycled in place when its slot is released, so
/// no field may own memory past [`TaskDesc::recycle`].
pub(crate) struct TaskDesc {
    pub(crate) state: State,
    /// Final status of the task, encoded via [`Error::to_code`]. Written at
    /// most once per submission: the first error (or cancellation) wins.
    status: AtomicU32,
    /// Instances that have not yet finished executing.
    pub(crate) remaining: AtomicU32,
    /// Dispatch counter handing out distinct `instance_num`s.
    pub(crate) next_instance: AtomicU32,
    pub(crate) num_instances: AtomicU32,
    pub(crate) gate: Gate,
    inner: spin::Mutex<TaskInner>,
}

/// Cold task fields, written under the spinlock at submit time and cleared
/// at retirement.
#[derive(Default)]
pub(crate) struct TaskInner {
    pub(crate) job: JobId,
    pub(crate) action: Option<Arc<ActionFn>>,
    pub(crate) node_local: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) args: Option<Arc<[u8]>>,
    pub(crate) result: Vec<u8>,
    pub(crate) group: Option<GroupHandle>,
    pub(crate) queue: Option<QueueHandle>,
    pub(crate) queue_seq: u64,
    pub(crate) priority: u8,
    pub(crate) affinity: AffinitySet,
    pub(crate) on_complete: Option<Arc<CompletionFn>>,
}

// === impl TaskDesc ===

impl TaskDesc {
    pub(crate) fn new() -> Self {
        Self {
            state: State::new(),
            status: AtomicU32::new(CODE_SUCCESS),
            remaining: AtomicU32::new(0),
            next_instance: AtomicU32::new(0),
            num_instances: AtomicU32::new(0),
            gate: Gate::new(),
            inner: spin::Mutex::new(TaskInner::default()),
        }
    }

    /// Arms a freshly acquired descriptor for a new submission.
    pub(crate) fn prepare(&self, inner: TaskInner, instances: u32, detached: bool) {
        debug_assert!(instances >= 1);

        self.state.reset(detached);
        self.status.store(CODE_SUCCESS, Ordering::Release);
        self.remaining.store(instances, Ordering::Release);
        self.next_instance.store(0, Ordering::Release);
        self.num_instances.store(instances, Ordering::Release);
        *self.inner.lock() = inner;
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut TaskInner) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Records `error` as the task's final status. The first recorded error
    /// sticks; later attempts (other instances, racing cancels) lose.
    pub(crate) fn record_error(&self, error: Error) {
        let _ = self.status.compare_exchange(
            CODE_SUCCESS,
            error.to_code(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn status(&self) -> Status {
        Error::from_code(self.status.load(Ordering::Acquire))
    }

    /// Clears everything that owns memory so the slot can sit in the
    /// freelist without pinning buffers or closures.
    pub(crate) fn recycle(&self) {
        self.state.to_retired();
        *self.inner.lock() = TaskInner::default();
    }
}

impl fmt::Debug for TaskDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDesc")
            .field("state", &self.state)
            .field("status", &self.status.load(Ordering::Relaxed))
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Per-submission attributes.
#[derive(Clone, Default)]
pub struct TaskAttributes {
    pub(crate) priority: u8,
    pub(crate) affinity: AffinitySet,
    pub(crate) instances: u32,
    pub(crate) detached: bool,
    pub(crate) on_complete: Option<Arc<CompletionFn>>,
}

// === impl TaskAttributes ===

impl TaskAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduling hint; `0` is the highest priority. Values are clamped to
    /// the supported priority levels.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Restricts execution to the given worker indices.
    pub fn affinity(mut self, affinity: AffinitySet) -> Self {
        self.affinity = affinity;
        self
    }

    /// Number of parallel copies of the task; each copy observes a distinct
    /// `instance_num`. Defaults to 1.
    pub fn instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    /// Marks the task as detached: the caller will not wait for it and the
    /// descriptor is reclaimed eagerly once it completes.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Registers a callback to run after the action returns (or the task is
    /// cancelled), with the task's final status.
    pub fn on_complete(mut self, f: impl Fn(TaskHandle, Status) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for TaskAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskAttributes")
            .field("priority", &self.priority)
            .field("affinity", &self.affinity)
            .field("instances", &self.instances.max(1))
            .field("detached", &self.detached)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Fluent submission builder returned by [`Node::task`].
#[must_use = "building a task does nothing until it is submitted"]
pub struct TaskBuilder<'node> {
    pub(crate) node: &'node Node,
    pub(crate) job: JobId,
    pub(crate) args: Arc<[u8]>,
    pub(crate) group: Option<GroupHandle>,
    pub(crate) queue: Option<QueueHandle>,
    pub(crate) attrs: TaskAttributes,
}

// === impl TaskBuilder ===

impl<'node> TaskBuilder<'node> {
    /// Argument bytes for the action; moved into the descriptor.
    pub fn args(mut self, args: &[u8]) -> Self {
        self.args = Arc::from(args);
        self
    }

    /// Attaches the task to a completion group.
    pub fn group(mut self, group: GroupHandle) -> Self {
        self.group = Some(group);
        self
    }

    /// Routes the task through a queue. The queue must be bound to the same
    /// job the task was built for.
    pub fn queue(mut self, queue: QueueHandle) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.attrs.priority = priority;
        self
    }

    pub fn affinity(mut self, affinity: AffinitySet) -> Self {
        self.attrs.affinity = affinity;
        self
    }

    pub fn instances(mut self, instances: u32) -> Self {
        self.attrs.instances = instances;
        self
    }

    pub fn detached(mut self) -> Self {
        self.attrs.detached = true;
        self
    }

    pub fn on_complete(mut self, f: impl Fn(TaskHandle, Status) + Send + Sync + 'static) -> Self {
        self.attrs.on_complete = Some(Arc::new(f));
        self
    }

    /// Hands the task to the scheduler.
    pub fn submit(self) -> Result<TaskHandle, Error> {
        self.node
            .submit_prepared(self.job, self.args, self.group, self.queue, self.attrs)
    }
}

/// Execution context passed to every action invocation.
pub struct TaskContext<'a> {
    pub(crate) node: &'a Node,
    pub(crate) task: &'a TaskDesc,
    pub(crate) handle: TaskHandle,
    pub(crate) args: Arc<[u8]>,
    pub(crate) node_local: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) instance_num: u32,
    pub(crate) num_instances: u32,
    pub(crate) worker_index: usize,
}

// === impl TaskContext ===

impl<'a> TaskContext<'a> {
    /// The node executing this task, usable for recursive submission.
    pub fn node(&self) -> &'a Node {
        self.node
    }

    /// Handle of the task being executed.
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    /// Argument bytes passed at submission.
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Data registered alongside the action, downcast to `T`.
    pub fn node_local<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.node_local.as_deref().and_then(|any| any.downcast_ref())
    }

    /// Which parallel copy of the task this invocation is.
    pub fn instance_num(&self) -> u32 {
        self.instance_num
    }

    /// Total number of parallel copies.
    pub fn num_instances(&self) -> u32 {
        self.num_instances
    }

    /// Index of the worker thread running the action.
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// True once cancellation has been requested or the node is shutting
    /// down. Long-running actions should poll this and return early.
    pub fn should_cancel(&self) -> bool {
        self.task.state.cancel_requested() || self.node.is_stopping()
    }

    /// Overrides the task's final status. The first override wins; a task
    /// that never sets a status completes successfully.
    pub fn set_status(&self, error: Error) {
        self.task.record_error(error);
    }

    /// Stores the task's result bytes, replacing any previous write.
    pub fn write_result(&self, bytes: &[u8]) {
        self.task.with_inner(|inner| {
            inner.result.clear();
            inner.result.extend_from_slice(bytes);
        });
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.handle)
            .field("instance_num", &self.instance_num)
            .field("num_instances", &self.num_instances)
            .field("worker_index", &self.worker_index)
            .finish_non_exhaustive()
    }
}
