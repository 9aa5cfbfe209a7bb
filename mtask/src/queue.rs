// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task queues: per-resource serialisation of submissions.
//!
//! An **ordered** queue (the default) runs one task at a time, in enqueue
//! order. A **retain-order** queue runs up to `parallelism` tasks
//! concurrently but withholds completion *signalling* until every earlier
//! task of the queue has signalled, so observers see completions in enqueue
//! order either way.

use crate::error::Error;
use crate::handle::QueueHandle;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::node::Node;
use crate::park::Gate;
use crate::registry::JobId;
use core::fmt;
use std::collections::{BTreeMap, VecDeque};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct QueueFlags: u8 {
        /// Strict serial FIFO: execution order equals enqueue order.
        const ORDERED = 1 << 0;
        /// Parallel execution with completion signalling in enqueue order.
        const RETAIN_ORDER = 1 << 1;
    }
}

/// Attributes for [`Node::create_queue`](crate::Node::create_queue).
#[derive(Debug, Clone)]
pub struct QueueAttributes {
    pub(crate) ordered: bool,
    /// Concurrency bound for unordered queues; `0` means "one per worker".
    pub(crate) parallelism: usize,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        Self {
            ordered: true,
            parallelism: 0,
        }
    }
}

// === impl QueueAttributes ===

impl QueueAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` (default) serialises the queue; `false` allows parallel
    /// execution while completions are still delivered in enqueue order.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Concurrency bound for unordered queues.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }
}

/// Pooled queue descriptor.
pub(crate) struct QueueDesc {
    enabled: AtomicBool,
    /// Tasks enqueued but not yet signalled; deletion waits for zero.
    outstanding: AtomicUsize,
    pub(crate) gate: Gate,
    inner: spin::Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    job: JobId,
    flags: QueueFlags,
    parallelism: usize,
    /// Packed handles not yet handed to the scheduler, in enqueue order.
    pending: VecDeque<u64>,
    /// Tasks currently handed to the scheduler (dispatched or ready).
    in_flight: usize,
    /// Next sequence number to assign at enqueue.
    next_seq: u64,
    /// Next sequence number allowed to signal (retain-order mode).
    next_signal: u64,
    /// Completed but not yet signalled tasks, keyed by sequence number.
    finished: BTreeMap<u64, u64>,
    /// Guards in-order delivery: only one thread drains `finished`.
    draining: bool,
}

impl Default for QueueFlags {
    fn default() -> Self {
        QueueFlags::ORDERED
    }
}

// === impl QueueDesc ===

impl QueueDesc {
    pub(crate) fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            gate: Gate::new(),
            inner: spin::Mutex::new(QueueInner::default()),
        }
    }

    pub(crate) fn prepare(&self, job: JobId, attrs: &QueueAttributes, default_parallelism: usize) {
        let flags = if attrs.ordered {
            QueueFlags::ORDERED
        } else {
            QueueFlags::RETAIN_ORDER
        };
        let parallelism = if attrs.ordered {
            1
        } else if attrs.parallelism == 0 {
            default_parallelism.max(1)
        } else {
            attrs.parallelism
        };

        *self.inner.lock() = QueueInner {
            job,
            flags,
            parallelism,
            ..QueueInner::default()
        };
        self.outstanding.store(0, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
    }

    pub(crate) fn recycle(&self) {
        self.enabled.store(false, Ordering::Release);
        self.outstanding.store(0, Ordering::Release);
        *self.inner.lock() = QueueInner::default();
    }

    pub(crate) fn job(&self) -> JobId {
        self.inner.lock().job
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Accepts a task into the queue. `record_seq` is invoked with the
    /// task's delivery sequence while the queue lock is held, so enqueue
    /// order and delivery order cannot diverge under racing submitters.
    /// Returns `true` if the task can be handed to the scheduler
    /// immediately, `false` if it has to stay pending.
    pub(crate) fn admit(
        &self,
        packed: u64,
        record_seq: impl FnOnce(u64),
    ) -> Result<bool, Error> {
        if !self.is_enabled() {
            return Err(Error::QueueDisabled);
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);

        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        record_seq(seq);

        // strict FIFO: a task may only bypass `pending` if nothing is ahead
        // of it
        if inner.pending.is_empty() && inner.in_flight < inner.parallelism {
            inner.in_flight += 1;
            Ok(true)
        } else {
            inner.pending.push_back(packed);
            Ok(false)
        }
    }

    /// Marks one in-flight task as finished executing and collects the
    /// consequences: tasks to promote to the scheduler and completions that
    /// may now be signalled, in delivery order.
    ///
    /// Multiple completions can race here; the `draining` flag makes sure a
    /// single caller at a time delivers signals, preserving enqueue order.
    pub(crate) fn on_finished(&self, seq: u64, packed: u64) -> QueueWork {
        let mut work = QueueWork::default();
        let mut inner = self.inner.lock();

        debug_assert!(inner.in_flight > 0);
        inner.in_flight -= 1;
        inner.finished.insert(seq, packed);

        // refill the scheduler up to the concurrency bound
        while inner.in_flight < inner.parallelism {
            let Some(next) = inner.pending.pop_front() else {
                break;
            };
            inner.in_flight += 1;
            work.promote.push(next);
        }

        if !inner.draining {
            inner.draining = true;
            while let Some(done) = {
                let next_signal = inner.next_signal;
                inner.finished.remove(&next_signal)
            } {
                inner.next_signal += 1;
                work.signal.push(done);
            }
            if work.signal.is_empty() {
                inner.draining = false;
            } else {
                work.drained = true;
            }
        }

        work
    }

    /// Continues an in-order delivery drain after the caller signalled the
    /// previous batch. Returns the next batch, or releases the drain lock
    /// and returns an empty batch.
    pub(crate) fn continue_drain(&self) -> Vec<u64> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.draining);

        let mut batch = Vec::new();
        while let Some(done) = {
            let next_signal = inner.next_signal;
            inner.finished.remove(&next_signal)
        } {
            inner.next_signal += 1;
            batch.push(done);
        }
        if batch.is_empty() {
            inner.draining = false;
        }
        batch
    }

    /// Accounts a delivered completion towards deletion.
    pub(crate) fn task_retired(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        self.gate.notify_all();
    }
}

impl fmt::Debug for QueueDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("QueueDesc")
            .field("job", &inner.job)
            .field("flags", &inner.flags)
            .field("parallelism", &inner.parallelism)
            .field("pending", &inner.pending.len())
            .field("in_flight", &inner.in_flight)
            .field("enabled", &self.enabled)
            .field("outstanding", &self.outstanding)
            .finish_non_exhaustive()
    }
}

/// Follow-up work computed while holding the queue lock, executed after it
/// is released.
#[derive(Default)]
pub(crate) struct QueueWork {
    /// Packed handles to hand to the scheduler.
    pub(crate) promote: Vec<u64>,
    /// Packed handles whose completion may now be signalled, in order.
    pub(crate) signal: Vec<u64>,
    /// Whether the caller holds the drain lock and must call
    /// [`QueueDesc::continue_drain`] until it returns empty.
    pub(crate) drained: bool,
}

/// Public queue operations, parameterised over the node so they can reach
/// the scheduler and pools.
impl Node {
    /// Re-enables a previously disabled queue.
    pub fn queue_enable(&self, queue: QueueHandle) -> Result<(), Error> {
        let desc = self.queues().lookup(queue.0)?;
        desc.set_enabled(true);
        tracing::debug!(queue = ?queue, "queue enabled");
        Ok(())
    }

    /// Disables the queue: subsequent submissions fail with
    /// [`Error::QueueDisabled`]. Already-enqueued tasks still run.
    pub fn queue_disable(&self, queue: QueueHandle) -> Result<(), Error> {
        let desc = self.queues().lookup(queue.0)?;
        desc.set_enabled(false);
        tracing::debug!(queue = ?queue, "queue disabled");
        Ok(())
    }

    /// Deletes the queue, blocking until every enqueued task has retired.
    pub fn queue_delete(&self, queue: QueueHandle) -> Result<(), Error> {
        let desc = self.queues().lookup(queue.0)?;
        desc.set_enabled(false);

        crate::scheduler::wait_for(self, &desc.gate, None, || desc.outstanding() == 0);

        desc.recycle();
        self.queues().release(queue.0)?;
        tracing::debug!(queue = ?queue, "queue deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ordered_queue() -> QueueDesc {
        let queue = QueueDesc::new();
        queue.prepare(JobId::new(0), &QueueAttributes::new(), 4);
        queue
    }

    fn admit(queue: &QueueDesc, packed: u64) -> (bool, u64) {
        let mut seq = 0;
        let now = queue.admit(packed, |s| seq = s).unwrap();
        (now, seq)
    }

    #[test]
    fn ordered_admits_one_at_a_time() {
        let queue = ordered_queue();

        let (now, seq0) = admit(&queue, 100);
        assert!(now);
        assert_eq!(seq0, 0);

        // second task must wait for the first to finish
        let (now, seq1) = admit(&queue, 101);
        assert!(!now);
        assert_eq!(seq1, 1);

        let work = queue.on_finished(seq0, 100);
        assert_eq!(work.promote, vec![101]);
        assert_eq!(work.signal, vec![100]);
        assert!(work.drained);
        assert!(queue.continue_drain().is_empty());
    }

    #[test]
    fn retain_order_withholds_signals() {
        let queue = QueueDesc::new();
        queue.prepare(
            JobId::new(0),
            &QueueAttributes::new().ordered(false).parallelism(2),
            4,
        );

        let (a, seq_a) = admit(&queue, 1);
        let (b, seq_b) = admit(&queue, 2);
        assert!(a);
        assert!(b);

        // the second task finishes first: its signal is withheld
        let work = queue.on_finished(seq_b, 2);
        assert!(work.signal.is_empty());

        // once the first finishes, both are delivered in enqueue order
        let work = queue.on_finished(seq_a, 1);
        assert_eq!(work.signal, vec![1, 2]);
        assert!(work.drained);
        assert!(queue.continue_drain().is_empty());
    }

    #[test]
    fn disabled_queue_rejects() {
        let queue = ordered_queue();
        queue.set_enabled(false);
        assert_eq!(queue.admit(7, |_| {}).unwrap_err(), Error::QueueDisabled);
    }
}
