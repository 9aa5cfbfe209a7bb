// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::park::Gate;
use std::collections::VecDeque;

/// Completion barrier spanning many tasks.
///
/// `num_tasks` counts attached tasks that have not yet signalled completion;
/// it is incremented at submit and decremented after the completed task has
/// pushed its own handle onto the completion FIFO. Waiters therefore never
/// observe a zero count with a completion still missing from the FIFO.
pub(crate) struct GroupDesc {
    num_tasks: AtomicUsize,
    deleted: AtomicBool,
    /// Packed handles of tasks that finished since the last wait drained
    /// them, in completion order.
    completions: spin::Mutex<VecDeque<u64>>,
    pub(crate) gate: Gate,
}

// === impl GroupDesc ===

impl GroupDesc {
    pub(crate) fn new() -> Self {
        Self {
            num_tasks: AtomicUsize::new(0),
            deleted: AtomicBool::new(false),
            completions: spin::Mutex::new(VecDeque::new()),
            gate: Gate::new(),
        }
    }

    pub(crate) fn recycle(&self) {
        self.num_tasks.store(0, Ordering::Release);
        self.deleted.store(false, Ordering::Release);
        self.completions.lock().clear();
    }

    pub(crate) fn num_tasks(&self) -> usize {
        self.num_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Attaches one more task. Tasks may keep arriving while a `wait_all` is
    /// in flight; the wait covers them too.
    pub(crate) fn task_attached(&self) {
        self.num_tasks.fetch_add(1, Ordering::AcqRel);
    }

    /// Detaches a task that failed submission after it was counted.
    pub(crate) fn task_aborted(&self) {
        let prev = self.num_tasks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        self.gate.notify_all();
    }

    /// Records a completed task: the handle is pushed *before* the counter
    /// drops so a waiter woken by the decrement always finds the completion.
    pub(crate) fn task_completed(&self, packed: u64) {
        self.completions.lock().push_back(packed);
        let prev = self.num_tasks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "group completion without attached task");
        self.gate.notify_all();
    }

    /// Pops the oldest undelivered completion.
    pub(crate) fn pop_completion(&self) -> Option<u64> {
        self.completions.lock().pop_front()
    }

    pub(crate) fn has_completions(&self) -> bool {
        !self.completions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_tracks_attach_and_complete() {
        let group = GroupDesc::new();
        assert_eq!(group.num_tasks(), 0);

        group.task_attached();
        group.task_attached();
        assert_eq!(group.num_tasks(), 2);

        group.task_completed(1);
        assert_eq!(group.num_tasks(), 1);
        assert_eq!(group.pop_completion(), Some(1));
        assert_eq!(group.pop_completion(), None);

        group.task_completed(2);
        assert_eq!(group.num_tasks(), 0);
    }

    #[test]
    fn completions_keep_fifo_order() {
        let group = GroupDesc::new();
        for _ in 0..3 {
            group.task_attached();
        }
        for packed in [7, 8, 9] {
            group.task_completed(packed);
        }
        assert_eq!(group.pop_completion(), Some(7));
        assert_eq!(group.pop_completion(), Some(8));
        assert_eq!(group.pop_completion(), Some(9));
    }
}
