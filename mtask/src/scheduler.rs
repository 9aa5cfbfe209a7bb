// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Dispatch machinery: per-worker deques, the global injector, stealing,
//! parking, task execution and completion signalling.
//!
//! Routing policy: a worker submitting work pushes onto its own deque
//! (locality); any other thread pushes into the injector and wakes one
//! parked worker. Affinity-restricted tasks go to the *pinned* side queue of
//! an allowed worker, which thieves never touch.

pub(crate) mod deque;

use crate::affinity::AffinitySet;
use crate::error::Error;
use crate::handle::{RawHandle, TaskHandle};
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::node::Node;
use crate::park::{Gate, Parker};
use crate::task::{StartRunAction, TaskContext, TaskDesc};
use core::cell::Cell;
use core::hint;
use deque::{Deque, Steal};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Distinct priority levels; attribute values are clamped into this range.
pub(crate) const PRIORITY_LEVELS: usize = 4;

/// Iterations a worker spins through its dispatch sources before parking.
const SPIN_BUDGET: usize = 1024;

/// Victim-selection rounds per steal attempt.
const STEAL_ROUNDS: usize = 4;

/// How long a helping waiter naps when there is neither progress nor work.
const HELP_NAP: Duration = Duration::from_micros(200);

std::thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The worker index of the calling thread, if it is one of the node's
/// workers.
pub(crate) fn current_worker() -> Option<usize> {
    CURRENT_WORKER.with(Cell::get)
}

pub(crate) fn set_current_worker(index: Option<usize>) {
    CURRENT_WORKER.with(|cell| cell.set(index));
}

pub(crate) struct Scheduler {
    workers: Box<[WorkerShared]>,
    injector: Injector,
    stop: AtomicBool,
    /// Tasks submitted but not yet signalled; drained by finalize.
    in_flight: AtomicUsize,
    /// Released whenever `in_flight` drops to zero.
    pub(crate) idle_gate: Gate,
    /// Rotates placement of pinned tasks among their allowed workers.
    pinned_rr: AtomicUsize,
}

pub(crate) struct WorkerShared {
    deque: Deque,
    /// Affinity-bound tasks; any thread pushes, only the owner pops.
    pinned: spin::Mutex<VecDeque<u64>>,
    parked: AtomicBool,
    parker: Parker,
    rng: spin::Mutex<fastrand::Rng>,
}

struct Injector {
    /// One FIFO per priority level, popped highest (0) first.
    levels: Box<[spin::Mutex<VecDeque<u64>>]>,
    len: AtomicUsize,
}

// === impl Injector ===

impl Injector {
    fn new() -> Self {
        Self {
            levels: (0..PRIORITY_LEVELS)
                .map(|_| spin::Mutex::new(VecDeque::new()))
                .collect(),
            len: AtomicUsize::new(0),
        }
    }

    fn push(&self, priority: u8, packed: u64) {
        let level = usize::from(priority).min(PRIORITY_LEVELS - 1);
        self.levels[level].lock().push_back(packed);
        self.len.fetch_add(1, Ordering::AcqRel);
    }

    fn pop(&self) -> Option<u64> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        for level in self.levels.iter() {
            if let Some(packed) = level.lock().pop_front() {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Some(packed);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }
}

// === impl Scheduler ===

impl Scheduler {
    pub(crate) fn new(num_workers: usize, deque_capacity: usize, seed: u64) -> Self {
        let workers = (0..num_workers)
            .map(|index| WorkerShared {
                deque: Deque::with_capacity(deque_capacity),
                pinned: spin::Mutex::new(VecDeque::new()),
                parked: AtomicBool::new(false),
                parker: Parker::new(),
                rng: spin::Mutex::new(fastrand::Rng::with_seed(
                    seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                )),
            })
            .collect::<Box<[_]>>();

        crate::alloc::record_alloc(num_workers * size_of::<WorkerShared>());

        Self {
            workers,
            injector: Injector::new(),
            stop: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle_gate: Gate::new(),
            pinned_rr: AtomicUsize::new(0),
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.unpark_all();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn task_submitted(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Rolls back a submission that was counted but never dispatched.
    pub(crate) fn submit_aborted(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == 1 {
            self.idle_gate.notify_all();
        }
    }

    pub(crate) fn task_signalled(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == 1 {
            self.idle_gate.notify_all();
        }
    }

    /// Hands a ready task entry to the dispatch machinery.
    pub(crate) fn enqueue(&self, packed: u64, priority: u8, affinity: &AffinitySet) {
        if !affinity.is_unrestricted() {
            // pinned: round-robin among the allowed workers, wake that
            // worker specifically since nobody else may run the task
            let allowed: Vec<usize> = affinity.iter(self.workers.len()).collect();
            if let Some(&target) = allowed
                .get(self.pinned_rr.fetch_add(1, Ordering::Relaxed) % allowed.len().max(1))
                .or(allowed.first())
            {
                tracing::trace!(entry = packed, worker = target, "enqueue pinned");
                self.workers[target].pinned.lock().push_back(packed);
                self.workers[target].parker.unpark();
                return;
            }
            // affinity names no live worker; fall through to the injector so
            // the entry is not lost (it will run wherever it is popped)
        }

        if let Some(index) = current_worker() {
            if let Err(deque::Full(packed)) = self.workers[index].deque.push(packed) {
                tracing::trace!(entry = packed, "deque full, overflow to injector");
                self.injector.push(priority, packed);
            } else {
                tracing::trace!(entry = packed, worker = index, "enqueue local");
            }
        } else {
            tracing::trace!(entry = packed, "enqueue remote");
            self.injector.push(priority, packed);
        }
        self.unpark_one();
    }

    /// Finds the next entry for `worker` to run: pinned work first, then the
    /// local deque (LIFO), then the injector, then stealing.
    pub(crate) fn dispatch(&self, worker: usize) -> Option<u64> {
        let shared = &self.workers[worker];

        if let Some(packed) = shared.pinned.lock().pop_front() {
            return Some(packed);
        }
        if let Some(packed) = shared.deque.pop() {
            return Some(packed);
        }
        if let Some(packed) = self.injector.pop() {
            return Some(packed);
        }
        self.steal(worker)
    }

    fn steal(&self, worker: usize) -> Option<u64> {
        let num_workers = self.workers.len();
        if num_workers <= 1 {
            return None;
        }

        for round in 0..STEAL_ROUNDS {
            // start from a random victim so thieves spread out
            let start = self.workers[worker].rng.lock().usize(0..num_workers);
            let mut contended = false;

            for i in 0..num_workers {
                let victim = (start + i) % num_workers;
                if victim == worker {
                    continue;
                }
                match self.workers[victim].deque.steal() {
                    Steal::Stolen(packed) => {
                        tracing::trace!(entry = packed, victim, thief = worker, "stole task");
                        return Some(packed);
                    }
                    Steal::Retry => contended = true,
                    Steal::Empty => {}
                }
            }

            if !contended {
                return None;
            }
            for _ in 0..(1 << round) {
                hint::spin_loop();
            }
        }
        None
    }

    /// Returns `true` if `worker` could plausibly find work right now.
    fn has_work_hint(&self, worker: usize) -> bool {
        if !self.injector.is_empty() {
            return true;
        }
        if !self.workers[worker].pinned.lock().is_empty() {
            return true;
        }
        self.workers.iter().any(|shared| !shared.deque.is_empty())
    }

    /// Spins briefly, then blocks `worker` until new work is enqueued or the
    /// node shuts down.
    pub(crate) fn park(&self, worker: usize) {
        for _ in 0..SPIN_BUDGET {
            if self.has_work_hint(worker) || self.is_stopping() {
                return;
            }
            hint::spin_loop();
        }

        let shared = &self.workers[worker];
        shared.parked.store(true, Ordering::Release);
        // final check closes the race against a concurrent enqueue that
        // scanned the parked flags before we set ours
        if self.has_work_hint(worker) || self.is_stopping() {
            shared.parked.store(false, Ordering::Release);
            return;
        }
        tracing::trace!(worker, "parking");
        shared.parker.park();
        shared.parked.store(false, Ordering::Release);
        tracing::trace!(worker, "unparked");
    }

    pub(crate) fn unpark_one(&self) {
        for shared in self.workers.iter() {
            if shared.parked.load(Ordering::Acquire) {
                shared.parker.unpark();
                return;
            }
        }
    }

    pub(crate) fn unpark_all(&self) {
        for shared in self.workers.iter() {
            shared.parker.unpark();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        crate::alloc::record_dealloc(self.workers.len() * size_of::<WorkerShared>());
    }
}

/// Blocks until `pred` holds or `deadline` passes.
///
/// On a worker thread this does not block at all: the worker keeps running
/// pending tasks while it waits (the submit-and-wait-inside-an-action
/// pattern would deadlock a fixed pool otherwise). Other threads wait on the
/// gate.
pub(crate) fn wait_for(
    node: &Node,
    gate: &Gate,
    deadline: Option<Instant>,
    pred: impl Fn() -> bool,
) -> bool {
    if pred() {
        return true;
    }

    let Some(worker) = current_worker() else {
        return gate.wait_until(deadline, || pred());
    };

    loop {
        if pred() {
            return true;
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return pred();
        }

        if let Some(packed) = node.scheduler().dispatch(worker) {
            run_entry(node, packed, worker);
        } else if gate.wait_until(Some(Instant::now() + HELP_NAP), || pred()) {
            return true;
        }
    }
}

/// Executes one dispatched entry: resolves the handle, runs (or skips) the
/// action, and performs completion when the last instance finishes.
pub(crate) fn run_entry(node: &Node, packed: u64, worker: usize) {
    let Some(raw) = RawHandle::unpack(packed) else {
        return;
    };
    let Ok(task) = node.tasks().lookup(raw) else {
        // the descriptor was retired while this entry sat in a queue
        tracing::trace!(task = ?raw, "dropping stale entry");
        return;
    };

    match task.state.start_run() {
        StartRunAction::Skip => {}
        StartRunAction::Cancelled => {
            tracing::trace!(task = ?raw, "cancelled before run");
            task.record_error(Error::Cancelled);
            finish(node, raw, task);
        }
        StartRunAction::Run => {
            let instance_num = task.next_instance.fetch_add(1, Ordering::AcqRel);
            let num_instances = task.num_instances.load(Ordering::Acquire);
            if instance_num >= num_instances {
                return;
            }

            invoke(node, raw, task, instance_num, num_instances, worker);

            if task.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                task.state.complete();
                finish(node, raw, task);
            }
        }
    }
}

fn invoke(
    node: &Node,
    raw: RawHandle,
    task: &TaskDesc,
    instance_num: u32,
    num_instances: u32,
    worker: usize,
) {
    let (func, node_local, args) = task.with_inner(|inner| {
        (
            inner.action.clone(),
            inner.node_local.clone(),
            inner.args.clone().unwrap_or_else(|| Arc::from(&[0u8; 0][..])),
        )
    });
    let Some(func) = func else {
        // cannot happen for a task that passed submit validation
        unreachable!("dispatched task {raw:?} has no action");
    };

    let ctx = TaskContext {
        node,
        task,
        handle: TaskHandle(raw),
        args,
        node_local,
        instance_num,
        num_instances,
        worker_index: worker,
    };

    tracing::trace!(task = ?raw, instance_num, worker, "running action");
    if catch_unwind(AssertUnwindSafe(|| func(&ctx))).is_err() {
        tracing::warn!(task = ?raw, "action panicked");
        task.record_error(Error::ActionPanicked);
    }
}

/// Post-execution bookkeeping. Plain tasks signal immediately; queued tasks
/// go through their queue so ordered queues can promote a successor and
/// retain-order queues can defer signalling until predecessors are done.
fn finish(node: &Node, raw: RawHandle, task: &TaskDesc) {
    let (queue, seq) = task.with_inner(|inner| (inner.queue, inner.queue_seq));

    let Some(queue) = queue else {
        signal_completion(node, raw, task, None);
        return;
    };

    let Ok(qdesc) = node.queues().lookup(queue.0) else {
        // the queue vanished mid-flight; fall back to direct signalling
        signal_completion(node, raw, task, None);
        return;
    };

    let work = qdesc.on_finished(seq, raw.pack());

    for packed in work.promote {
        promote_queued(node, packed);
    }

    if work.drained {
        let mut batch = work.signal;
        loop {
            for packed in batch {
                signal_packed(node, packed, qdesc);
            }
            batch = qdesc.continue_drain();
            if batch.is_empty() {
                break;
            }
        }
    } else {
        debug_assert!(work.signal.is_empty());
    }
}

/// Moves a formerly pending queue task onto the dispatch machinery.
fn promote_queued(node: &Node, packed: u64) {
    let Some(raw) = RawHandle::unpack(packed) else {
        return;
    };
    let Ok(task) = node.tasks().lookup(raw) else {
        return;
    };

    let (priority, affinity) = task.with_inner(|inner| (inner.priority, inner.affinity));
    let instances = task.num_instances.load(Ordering::Acquire).max(1);
    task.state.to_ready();
    tracing::trace!(task = ?raw, "promoting queue head");
    for _ in 0..instances {
        node.scheduler().enqueue(packed, priority, &affinity);
    }
}

fn signal_packed(node: &Node, packed: u64, qdesc: &crate::queue::QueueDesc) {
    let Some(raw) = RawHandle::unpack(packed) else {
        return;
    };
    if let Ok(task) = node.tasks().lookup(raw) {
        signal_completion(node, raw, task, Some(qdesc));
    } else {
        qdesc.task_retired();
    }
}

/// Delivers a task's completion exactly once: completion callback, group
/// accounting, waiter wakeup, eager reclamation for detached tasks.
fn signal_completion(
    node: &Node,
    raw: RawHandle,
    task: &TaskDesc,
    queue: Option<&crate::queue::QueueDesc>,
) {
    if !task.state.try_signal() {
        return;
    }

    let status = task.status();
    let (job, group, on_complete) =
        task.with_inner(|inner| (inner.job, inner.group, inner.on_complete.clone()));

    tracing::trace!(task = ?raw, job = ?job, status = ?status, "task completed");

    if let Some(callback) = on_complete {
        let handle = TaskHandle(raw);
        if catch_unwind(AssertUnwindSafe(|| callback(handle, status))).is_err() {
            tracing::warn!(task = ?raw, "completion callback panicked");
        }
    }

    if let Some(group) = group
        && let Ok(gdesc) = node.groups().lookup(group.0)
    {
        gdesc.task_completed(raw.pack());
    }

    task.gate.notify_all();

    if let Some(qdesc) = queue {
        qdesc.task_retired();
    }

    let detached = task.state.is_detached();
    if detached {
        retire(node, raw, task);
    }

    node.scheduler().task_signalled();
}

/// Returns the descriptor to the pool. The caller must hold the exclusive
/// right to do so (detached completion, a consuming wait, or teardown).
pub(crate) fn retire(node: &Node, raw: RawHandle, task: &TaskDesc) {
    tracing::trace!(task = ?raw, "retiring task");
    task.recycle();
    let _ = node.tasks().release(raw);
    // a waiter may still be blocked on the gate (e.g. a direct wait racing a
    // group drain); wake it so it observes the stale handle
    task.gate.notify_all();
}
