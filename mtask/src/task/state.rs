// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU32, Ordering};
use core::fmt;

/// Task state. The task stores its state in an atomic `u32` with bitfields
/// for the necessary information:
///
/// ```text
/// | 6         6 | 5        5 | 4        4 | 3      3 | 2     0 |
/// |  signalled  |  consumed  |  detached  |  cancel  |  stage  |
/// ```
pub(crate) struct State {
    val: AtomicU32,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<u32> {
        /// Lifecycle stage of the task.
        pub(crate) const STAGE: Stage;
        /// If set, cancellation has been requested.
        pub(crate) const CANCEL: bool;
        /// If set, the task was submitted detached: nobody will wait on it
        /// and the descriptor is reclaimed eagerly at completion.
        pub(crate) const DETACHED: bool;
        /// If set, a waiter has claimed the exclusive right to retire the
        /// descriptor and take the result.
        pub(crate) const CONSUMED: bool;
        /// If set, completion has been signalled: the group was decremented,
        /// the gate released, and the status is visible.
        pub(crate) const SIGNALLED: bool;
    }
}

/// Lifecycle stage of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum Stage {
    /// Acquired from the pool, fields being filled in.
    Created = 0,
    /// Submit validation passed; not yet attached to a deque or promoted
    /// from a queue.
    PreReady = 1,
    /// Attached to a deque (or promoted to a queue head), eligible for
    /// dispatch.
    Ready = 2,
    /// At least one instance is executing on a worker.
    Running = 3,
    /// The action returned (or was skipped by cancellation).
    Completed = 4,
    /// Fully signalled and released back to the pool.
    Retired = 5,
}

/// What the dispatching worker should do with a task it popped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub(crate) enum StartRunAction {
    /// Invoke the action.
    Run,
    /// The task was cancelled before it started; the caller won the
    /// transition to `Completed` and must perform completion signalling
    /// without invoking the action.
    Cancelled,
    /// Stale or already-completed entry, drop it.
    Skip,
}

// === impl State ===

impl State {
    pub(crate) fn new() -> Self {
        Self {
            val: AtomicU32::new(Snapshot::initial(false).0),
        }
    }

    /// Re-arms the state for a freshly acquired descriptor.
    pub(crate) fn reset(&self, detached: bool) {
        self.val.store(Snapshot::initial(detached).0, Ordering::Release);
    }

    pub(crate) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.load(Ordering::Acquire).get(Snapshot::DETACHED)
    }

    pub(crate) fn is_signalled(&self) -> bool {
        self.load(Ordering::Acquire).get(Snapshot::SIGNALLED)
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.load(Ordering::Acquire).get(Snapshot::CANCEL)
    }

    /// `Created -> PreReady`, once submit validation has passed.
    pub(crate) fn to_pre_ready(&self) {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::STAGE), Stage::Created);
            s.set(Snapshot::STAGE, Stage::PreReady);
        });
    }

    /// `PreReady -> Ready`, once attached to a deque or promoted to a queue
    /// head.
    pub(crate) fn to_ready(&self) {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::STAGE), Stage::PreReady);
            s.set(Snapshot::STAGE, Stage::Ready);
        });
    }

    /// Attempt to transition into `Running` on behalf of a dispatching
    /// worker.
    pub(crate) fn start_run(&self) -> StartRunAction {
        self.transition(|s| match s.get(Snapshot::STAGE) {
            Stage::Ready => {
                if s.get(Snapshot::CANCEL) {
                    // cancelled before it ever ran: the action is skipped and
                    // whoever wins this transition signals completion.
                    s.set(Snapshot::STAGE, Stage::Completed);
                    StartRunAction::Cancelled
                } else {
                    s.set(Snapshot::STAGE, Stage::Running);
                    StartRunAction::Run
                }
            }
            // another instance of the same task is already running
            Stage::Running => StartRunAction::Run,
            _ => StartRunAction::Skip,
        })
    }

    /// `Running -> Completed`, performed by the last instance to finish.
    pub(crate) fn complete(&self) {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::STAGE), Stage::Running);
            s.set(Snapshot::STAGE, Stage::Completed);
        });
    }

    /// Requests cancellation. Wait-free and idempotent; returns `true` the
    /// first time the request lands on a task that has not completed yet.
    pub(crate) fn cancel(&self) -> bool {
        self.transition(|s| {
            if s.get(Snapshot::CANCEL) || s.get(Snapshot::STAGE) >= Stage::Completed {
                return false;
            }
            s.set(Snapshot::CANCEL, true);
            true
        })
    }

    /// Claims the right to perform completion signalling. Exactly one caller
    /// wins per task lifetime.
    pub(crate) fn try_signal(&self) -> bool {
        self.transition(|s| {
            debug_assert!(s.get(Snapshot::STAGE) >= Stage::Completed);
            if s.get(Snapshot::SIGNALLED) {
                return false;
            }
            s.set(Snapshot::SIGNALLED, true);
            true
        })
    }

    /// Claims the exclusive right to take the result and retire the
    /// descriptor. Only valid once completion has been signalled.
    pub(crate) fn try_consume(&self) -> bool {
        self.transition(|s| {
            if !s.get(Snapshot::SIGNALLED) || s.get(Snapshot::CONSUMED) {
                return false;
            }
            s.set(Snapshot::CONSUMED, true);
            true
        })
    }

    /// Final stage before the slot goes back to the pool.
    pub(crate) fn to_retired(&self) {
        self.transition(|s| {
            s.set(Snapshot::STAGE, Stage::Retired);
        });
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

// === impl Snapshot ===

impl Snapshot {
    fn initial(detached: bool) -> Self {
        Self::new()
            .with(Self::STAGE, Stage::Created)
            .with(Self::DETACHED, detached)
    }
}

impl mycelium_bitfield::FromBits<u32> for Stage {
    type Error = core::convert::Infallible;

    const BITS: u32 = 3;

    #[inline]
    fn try_from_bits(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Created as u32 => Ok(Self::Created),
            b if b == Self::PreReady as u32 => Ok(Self::PreReady),
            b if b == Self::Ready as u32 => Ok(Self::Ready),
            b if b == Self::Running as u32 => Ok(Self::Running),
            b if b == Self::Completed as u32 => Ok(Self::Completed),
            b if b == Self::Retired as u32 => Ok(Self::Retired),
            // this should never happen unless the bitpacking code is broken
            _ => unreachable!("invalid task stage {bits:#b}"),
        }
    }

    #[inline]
    fn into_bits(self) -> u32 {
        u32::from(self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(state: &State) -> Stage {
        state.load(Ordering::Acquire).get(Snapshot::STAGE)
    }

    #[test]
    fn happy_path() {
        let state = State::new();
        assert_eq!(stage(&state), Stage::Created);

        state.to_pre_ready();
        state.to_ready();
        assert_eq!(state.start_run(), StartRunAction::Run);
        state.complete();
        assert!(state.try_signal());
        assert!(!state.try_signal());
        assert!(state.try_consume());
        assert!(!state.try_consume());
        state.to_retired();
        assert_eq!(stage(&state), Stage::Retired);
    }

    #[test]
    fn cancel_before_run_skips_action() {
        let state = State::new();
        state.to_pre_ready();
        state.to_ready();

        assert!(state.cancel());
        // idempotent: only the first request reports success
        assert!(!state.cancel());

        assert_eq!(state.start_run(), StartRunAction::Cancelled);
        assert_eq!(stage(&state), Stage::Completed);
        // a second dispatch of the same entry finds it completed
        assert_eq!(state.start_run(), StartRunAction::Skip);
    }

    #[test]
    fn cancel_after_completion_is_noop() {
        let state = State::new();
        state.to_pre_ready();
        state.to_ready();
        assert_eq!(state.start_run(), StartRunAction::Run);
        state.complete();

        assert!(!state.cancel());
        assert!(!state.cancel_requested());
    }

    #[test]
    fn running_task_keeps_cancel_flag() {
        let state = State::new();
        state.to_pre_ready();
        state.to_ready();
        assert_eq!(state.start_run(), StartRunAction::Run);

        // a running task is not preempted, the flag is only advisory
        assert!(state.cancel());
        assert!(state.cancel_requested());
        assert_eq!(stage(&state), Stage::Running);
    }

    #[test]
    fn consume_requires_signal() {
        let state = State::new();
        state.to_pre_ready();
        state.to_ready();
        assert_eq!(state.start_run(), StartRunAction::Run);
        state.complete();

        assert!(!state.try_consume());
        assert!(state.try_signal());
        assert!(state.try_consume());
    }
}
