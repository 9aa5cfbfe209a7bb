// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The node: global runtime singleton owning pools, registry, scheduler and
//! worker threads.

use crate::affinity::MAX_WORKERS;
use crate::error::{Error, Status};
use crate::group::GroupDesc;
use crate::handle::{ActionHandle, GroupHandle, QueueHandle, TaskHandle};
use crate::pool::Pool;
use crate::queue::{QueueAttributes, QueueDesc};
use crate::registry::{ActionOptions, JobId, Registry};
use crate::scheduler::{self, Scheduler};
use crate::task::{TaskAttributes, TaskBuilder, TaskContext, TaskDesc, TaskInner};
use crate::worker;
use core::fmt;
use core::mem;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// The one live node, if any.
static CURRENT: spin::Mutex<Option<Arc<Node>>> = spin::Mutex::new(None);

/// Node bring-up configuration.
#[derive(Debug, Clone)]
pub struct NodeAttributes {
    pub(crate) num_workers: Option<usize>,
    pub(crate) task_pool_capacity: usize,
    pub(crate) group_pool_capacity: usize,
    pub(crate) queue_pool_capacity: usize,
    pub(crate) action_pool_capacity: usize,
    pub(crate) job_capacity: usize,
    pub(crate) finalize_timeout: Duration,
}

impl Default for NodeAttributes {
    fn default() -> Self {
        Self {
            num_workers: None,
            task_pool_capacity: 1024,
            group_pool_capacity: 128,
            queue_pool_capacity: 128,
            action_pool_capacity: 64,
            job_capacity: 256,
            finalize_timeout: Duration::from_secs(10),
        }
    }
}

// === impl NodeAttributes ===

impl NodeAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads. Defaults to the logical CPU count; always
    /// clamped to [`MAX_WORKERS`].
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    /// Capacity of the task descriptor pool (default 1024).
    pub fn task_pool_capacity(mut self, capacity: usize) -> Self {
        self.task_pool_capacity = capacity;
        self
    }

    /// Capacity of the group descriptor pool (default 128).
    pub fn group_pool_capacity(mut self, capacity: usize) -> Self {
        self.group_pool_capacity = capacity;
        self
    }

    /// Capacity of the queue descriptor pool (default 128).
    pub fn queue_pool_capacity(mut self, capacity: usize) -> Self {
        self.queue_pool_capacity = capacity;
        self
    }

    /// Capacity of the action descriptor pool (default 64).
    pub fn action_pool_capacity(mut self, capacity: usize) -> Self {
        self.action_pool_capacity = capacity;
        self
    }

    /// Highest admissible job id plus one (default 256).
    pub fn job_capacity(mut self, capacity: usize) -> Self {
        self.job_capacity = capacity;
        self
    }

    /// How long [`Node::finalize`] waits for in-flight tasks before
    /// reporting [`Error::Timeout`] (default 10s). Workers are joined either
    /// way; running actions are awaited, never killed.
    pub fn finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }
}

/// The global runtime: descriptor pools, the job table, the scheduler and
/// the worker threads.
pub struct Node {
    domain_id: u32,
    node_id: u32,
    finalize_timeout: Duration,
    tasks: Pool<TaskDesc>,
    groups: Pool<GroupDesc>,
    queues: Pool<QueueDesc>,
    registry: Registry,
    scheduler: Scheduler,
    threads: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

assert_impl_all!(Node: Send, Sync);

// === impl Node ===

impl Node {
    /// Brings up the global node: allocates pools and starts the workers.
    ///
    /// Fails with [`Error::NodeInitialized`] if a node is already up, and
    /// with [`Error::NoMemory`] if worker threads cannot be spawned.
    pub fn initialize(domain_id: u32, node_id: u32, attrs: NodeAttributes) -> Result<(), Error> {
        let mut current = CURRENT.lock();
        if current.is_some() {
            return Err(Error::NodeInitialized);
        }

        let num_workers = attrs
            .num_workers
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
            .clamp(1, MAX_WORKERS);

        tracing::debug!(domain_id, node_id, num_workers, "initializing node");

        let node = Arc::new(Node {
            domain_id,
            node_id,
            finalize_timeout: attrs.finalize_timeout,
            tasks: Pool::with_capacity(attrs.task_pool_capacity, |_| TaskDesc::new()),
            groups: Pool::with_capacity(attrs.group_pool_capacity, |_| GroupDesc::new()),
            queues: Pool::with_capacity(attrs.queue_pool_capacity, |_| QueueDesc::new()),
            registry: Registry::new(attrs.job_capacity, attrs.action_pool_capacity),
            scheduler: Scheduler::new(
                num_workers,
                attrs.task_pool_capacity.max(64),
                u64::from(domain_id) << 32 | u64::from(node_id),
            ),
            threads: std::sync::Mutex::new(Vec::with_capacity(num_workers)),
        });

        for index in 0..num_workers {
            match worker::spawn(Arc::clone(&node), index) {
                Ok(handle) => node
                    .threads
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(handle),
                Err(err) => {
                    tracing::error!(worker = index, %err, "failed to spawn worker");
                    node.scheduler.stop();
                    Self::join_workers(&node);
                    return Err(Error::NoMemory);
                }
            }
        }

        *current = Some(node);
        Ok(())
    }

    /// Returns a reference to the live node.
    pub fn current() -> Result<Arc<Node>, Error> {
        CURRENT.lock().clone().ok_or(Error::NodeNotInitialized)
    }

    /// Tears the node down: waits (bounded) for in-flight tasks, stops and
    /// joins the workers, and frees every pool.
    ///
    /// Returns [`Error::Timeout`] when in-flight tasks did not retire within
    /// the configured finalize timeout; the workers are joined regardless,
    /// so a still-running action is awaited, never killed.
    pub fn finalize() -> Result<(), Error> {
        // joining from a worker would deadlock on the worker joining itself
        if scheduler::current_worker().is_some() {
            return Err(Error::Busy);
        }

        let Some(node) = CURRENT.lock().take() else {
            return Err(Error::NodeNotInitialized);
        };

        tracing::debug!(
            domain_id = node.domain_id,
            node_id = node.node_id,
            "finalizing node"
        );

        node.scheduler.stop();

        let deadline = Instant::now() + node.finalize_timeout;
        let drained = node
            .scheduler
            .idle_gate
            .wait_until(Some(deadline), || node.scheduler.in_flight() == 0);

        Self::join_workers(&node);

        // whatever the application never waited on is still claimed; drain
        // it so the pools go back empty
        node.tasks.for_each_live(|raw, task| {
            task.recycle();
            let _ = node.tasks.release(raw);
        });

        if Arc::strong_count(&node) != 1 {
            // pools stay alive until those references drop
            tracing::warn!("node references still held at finalize");
        }
        drop(node);

        if drained { Ok(()) } else { Err(Error::Timeout) }
    }

    fn join_workers(node: &Arc<Node>) {
        let threads = mem::take(
            &mut *node
                .threads
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// The domain this node participates in.
    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }

    /// This node's id within its domain.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.scheduler.num_workers()
    }

    /// The calling thread's worker index, if it is one of this node's
    /// workers (i.e. the call happens inside an action).
    pub fn worker_index(&self) -> Option<usize> {
        scheduler::current_worker()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.scheduler.is_stopping()
    }

    // === actions ===

    /// Registers `func` as an action for `job`.
    pub fn register_action(
        &self,
        job: JobId,
        options: ActionOptions,
        func: impl Fn(&TaskContext<'_>) + Send + Sync + 'static,
    ) -> Result<ActionHandle, Error> {
        self.registry.register(job, options, Arc::new(func))
    }

    /// Unregisters an action. Tasks already dispatched keep running with
    /// their own reference to the function.
    pub fn delete_action(&self, action: ActionHandle) -> Result<(), Error> {
        self.registry.delete(action)
    }

    /// Re-enables a disabled action.
    pub fn enable_action(&self, action: ActionHandle) -> Result<(), Error> {
        self.registry.set_enabled(action, true)
    }

    /// Disables an action: it is skipped during job resolution until
    /// re-enabled.
    pub fn disable_action(&self, action: ActionHandle) -> Result<(), Error> {
        self.registry.set_enabled(action, false)
    }

    // === submission ===

    /// Starts building a task for `job`.
    pub fn task(&self, job: JobId) -> TaskBuilder<'_> {
        TaskBuilder {
            node: self,
            job,
            args: Arc::from(&[0u8; 0][..]),
            group: None,
            queue: None,
            attrs: TaskAttributes::default(),
        }
    }

    /// Submits a task with default attributes.
    pub fn submit(&self, job: JobId, args: &[u8]) -> Result<TaskHandle, Error> {
        self.task(job).args(args).submit()
    }

    /// Synchronous adapter: submits and waits, returning the result bytes.
    pub fn call(&self, job: JobId, args: &[u8]) -> Result<Vec<u8>, Error> {
        let task = self.submit(job, args)?;
        self.wait(task, None)
    }

    pub(crate) fn submit_prepared(
        &self,
        job: JobId,
        args: Arc<[u8]>,
        group: Option<GroupHandle>,
        queue: Option<QueueHandle>,
        attrs: TaskAttributes,
    ) -> Result<TaskHandle, Error> {
        if self.is_stopping() {
            return Err(Error::NodeNotInitialized);
        }

        let instances = attrs.instances.max(1);
        let action = self.registry.resolve(job, &attrs.affinity)?;

        // a queue is bound to one job at creation time; the submission must
        // name the same job
        if let Some(queue) = queue {
            let qdesc = self.queues.lookup(queue.0)?;
            if qdesc.job() != job {
                return Err(Error::UnknownJob);
            }
        }
        if let Some(group) = group {
            let gdesc = self.groups.lookup(group.0)?;
            if gdesc.is_deleted() {
                return Err(Error::InvalidHandle);
            }
        }

        let (raw, task) = self.tasks.acquire()?;
        task.prepare(
            TaskInner {
                job,
                action: Some(action.func),
                node_local: action.node_local,
                args: Some(args),
                result: Vec::new(),
                group,
                queue,
                queue_seq: 0,
                priority: attrs.priority,
                affinity: attrs.affinity,
                on_complete: attrs.on_complete.clone(),
            },
            instances,
            attrs.detached,
        );
        task.state.to_pre_ready();

        let handle = TaskHandle(raw);
        let packed = raw.pack();

        if let Some(group) = group {
            // the lookup above may have gone stale in the meantime; the
            // counter is what wait_all observes, so attach through a fresh
            // lookup
            match self.groups.lookup(group.0) {
                Ok(gdesc) => gdesc.task_attached(),
                Err(err) => {
                    task.recycle();
                    let _ = self.tasks.release(raw);
                    return Err(err);
                }
            }
        }

        self.scheduler.task_submitted();

        let dispatch_now = match queue {
            Some(queue) => {
                let admitted = self
                    .queues
                    .lookup(queue.0)
                    .and_then(|qdesc| {
                        qdesc.admit(packed, |seq| {
                            task.with_inner(|inner| inner.queue_seq = seq);
                        })
                    });
                match admitted {
                    Ok(dispatch_now) => dispatch_now,
                    Err(err) => {
                        // roll the submission back
                        if let Some(group) = group
                            && let Ok(gdesc) = self.groups.lookup(group.0)
                        {
                            gdesc.task_aborted();
                        }
                        self.scheduler.submit_aborted();
                        task.recycle();
                        let _ = self.tasks.release(raw);
                        return Err(err);
                    }
                }
            }
            None => true,
        };

        tracing::trace!(
            task = ?handle,
            job = ?job,
            instances,
            dispatch_now,
            "task submitted"
        );

        if dispatch_now {
            task.state.to_ready();
            for _ in 0..instances {
                self.scheduler.enqueue(packed, attrs.priority, &attrs.affinity);
            }
        }

        Ok(handle)
    }

    // === waiting & cancellation ===

    /// Blocks until the task completes, then takes its result bytes and
    /// retires the descriptor. `None` means no deadline; a zero timeout
    /// polls without blocking.
    ///
    /// Called from inside an action, this does not block the worker: the
    /// worker keeps executing other tasks while it waits.
    pub fn wait(&self, task: TaskHandle, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        let raw = task.0;
        let desc = self.tasks.lookup(raw)?;

        if desc.state.is_detached() {
            return Err(Error::Detached);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        // the predicate also trips when the descriptor is consumed by
        // someone else (a racing wait, a group drain): the stale lookup
        // breaks the wait instead of hanging on a recycled slot
        let done = scheduler::wait_for(self, &desc.gate, deadline, || {
            self.tasks.lookup(raw).is_err() || desc.state.is_signalled()
        });

        if !done {
            return Err(Error::Timeout);
        }

        let desc = self.tasks.lookup(raw)?;
        if !desc.state.try_consume() {
            return Err(Error::InvalidHandle);
        }

        let status = desc.status();
        let result = desc.with_inner(|inner| mem::take(&mut inner.result));
        scheduler::retire(self, raw, desc);

        status.map(|()| result)
    }

    /// Requests cooperative cancellation of a task.
    ///
    /// Wait-free and idempotent. A task that has not started yet will skip
    /// its action and complete with [`Error::Cancelled`]; a running task
    /// observes [`TaskContext::should_cancel`]; a completed task is
    /// unaffected.
    pub fn cancel(&self, task: TaskHandle) -> Result<(), Error> {
        self.cancel_with_status(task, Error::Cancelled)
    }

    /// Like [`cancel`](Self::cancel), recording `status` as the task's final
    /// status if the cancellation lands first.
    pub fn cancel_with_status(&self, task: TaskHandle, status: Error) -> Result<(), Error> {
        let desc = self.tasks.lookup(task.0)?;
        if desc.state.cancel() {
            desc.record_error(status);
            tracing::trace!(task = ?task, "cancellation requested");
        }
        Ok(())
    }

    // === groups ===

    /// Creates a completion group.
    pub fn create_group(&self) -> Result<GroupHandle, Error> {
        let (raw, desc) = self.groups.acquire()?;
        desc.recycle();
        tracing::debug!(group = ?raw, "group created");
        Ok(GroupHandle(raw))
    }

    /// Blocks until every task attached to the group has completed,
    /// including tasks submitted while the wait is in progress. Retires the
    /// drained completions.
    pub fn group_wait_all(&self, group: GroupHandle, timeout: Option<Duration>) -> Result<(), Error> {
        let gdesc = self.groups.lookup(group.0)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let done = scheduler::wait_for(self, &gdesc.gate, deadline, || gdesc.num_tasks() == 0);

        // completed tasks are retired on the spot even when the deadline
        // passed, so a later wait starts from a clean FIFO
        while let Some(packed) = gdesc.pop_completion() {
            self.consume_completion(packed);
        }

        if done { Ok(()) } else { Err(Error::Timeout) }
    }

    /// Dequeues one completed task of the group in completion order,
    /// returning its handle and recorded status. Returns
    /// [`Error::Timeout`] when no completion arrives in time (or
    /// immediately, when the group is idle and the FIFO empty).
    pub fn group_wait_any(
        &self,
        group: GroupHandle,
        timeout: Option<Duration>,
    ) -> Result<(TaskHandle, Status), Error> {
        let gdesc = self.groups.lookup(group.0)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            while let Some(packed) = gdesc.pop_completion() {
                let Some(raw) = crate::handle::RawHandle::unpack(packed) else {
                    continue;
                };
                let Ok(desc) = self.tasks.lookup(raw) else {
                    // consumed elsewhere (detached, direct wait); skip
                    continue;
                };
                let status = desc.status();
                if desc.state.try_consume() {
                    scheduler::retire(self, raw, desc);
                }
                return Ok((TaskHandle(raw), status));
            }

            if gdesc.num_tasks() == 0 {
                return Err(Error::Timeout);
            }

            let woken = scheduler::wait_for(self, &gdesc.gate, deadline, || {
                gdesc.has_completions() || gdesc.num_tasks() == 0
            });
            if !woken {
                return Err(Error::Timeout);
            }
        }
    }

    /// Deletes an idle group. Fails with [`Error::Busy`] while tasks are
    /// still attached.
    pub fn group_delete(&self, group: GroupHandle) -> Result<(), Error> {
        let gdesc = self.groups.lookup(group.0)?;
        if gdesc.num_tasks() > 0 {
            return Err(Error::Busy);
        }
        gdesc.mark_deleted();

        while let Some(packed) = gdesc.pop_completion() {
            self.consume_completion(packed);
        }

        gdesc.recycle();
        self.groups.release(group.0)?;
        tracing::debug!(group = ?group, "group deleted");
        Ok(())
    }

    fn consume_completion(&self, packed: u64) {
        let Some(raw) = crate::handle::RawHandle::unpack(packed) else {
            return;
        };
        let Ok(desc) = self.tasks.lookup(raw) else {
            return;
        };
        if desc.state.try_consume() {
            scheduler::retire(self, raw, desc);
        }
    }

    // === queues ===

    /// Creates a queue bound to `job`. The job must already have a
    /// registered action.
    pub fn create_queue(
        &self,
        job: JobId,
        attrs: QueueAttributes,
    ) -> Result<QueueHandle, Error> {
        // fail early instead of at first submission
        self.registry.resolve(job, &crate::affinity::AffinitySet::new())?;

        let (raw, desc) = self.queues.acquire()?;
        desc.prepare(job, &attrs, self.num_workers());
        tracing::debug!(queue = ?raw, job = ?job, ordered = attrs.ordered, "queue created");
        Ok(QueueHandle(raw))
    }

    // === internal accessors ===

    pub(crate) fn tasks(&self) -> &Pool<TaskDesc> {
        &self.tasks
    }

    pub(crate) fn groups(&self) -> &Pool<GroupDesc> {
        &self.groups
    }

    pub(crate) fn queues(&self) -> &Pool<QueueDesc> {
        &self.queues
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("domain_id", &self.domain_id)
            .field("node_id", &self.node_id)
            .field("num_workers", &self.num_workers())
            .field("in_flight", &self.scheduler.in_flight())
            .finish_non_exhaustive()
    }
}
