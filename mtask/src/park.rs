// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A one-thread parking primitive with a wake permit.
///
/// The permit makes unparking race-free: an `unpark` that arrives before the
/// target actually blocks is consumed by the next `park` instead of being
/// lost. Spurious wakeups are allowed and callers must re-check their
/// condition.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    permit: Mutex<bool>,
    cv: Condvar,
}

// === impl Parker ===

impl Parker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocks the calling thread until an unpark permit is available.
    pub(crate) fn park(&self) {
        let mut permit = lock(&self.permit);
        while !*permit {
            permit = self.cv.wait(permit).unwrap_or_else(PoisonError::into_inner);
        }
        *permit = false;
    }

    /// Makes a permit available, waking the parked thread if there is one.
    pub(crate) fn unpark(&self) {
        let mut permit = lock(&self.permit);
        *permit = true;
        drop(permit);
        self.cv.notify_one();
    }
}

/// Completion gate for task and group descriptors.
///
/// Waiters block here until a predicate over the descriptor's atomic state
/// becomes true; completers flip the state, then tap the gate. Taking the
/// lock before notifying closes the window between a waiter's predicate
/// check and its wait call.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    lock: Mutex<()>,
    cv: Condvar,
}

// === impl Gate ===

impl Gate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocks until `pred` returns true or `deadline` passes. Returns whether
    /// the predicate was satisfied.
    pub(crate) fn wait_until(
        &self,
        deadline: Option<Instant>,
        mut pred: impl FnMut() -> bool,
    ) -> bool {
        let mut guard = lock(&self.lock);
        loop {
            if pred() {
                return true;
            }
            match deadline {
                None => {
                    guard = self.cv.wait(guard).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return pred();
                    }
                    let (next, _) = self
                        .cv
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard = next;
                }
            }
        }
    }

    /// Wakes every waiter so they re-check their predicates.
    pub(crate) fn notify_all(&self) {
        drop(lock(&self.lock));
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = Parker::new();
        parker.unpark();
        // must return immediately by consuming the stored permit
        parker.park();
    }

    #[test]
    fn cross_thread_unpark() {
        let parker = Arc::new(Parker::new());

        let handle = {
            let parker = Arc::clone(&parker);
            thread::spawn(move || parker.park())
        };

        parker.unpark();
        handle.join().unwrap();
    }

    #[test]
    fn gate_wakes_waiter() {
        let gate = Arc::new(Gate::new());
        let flag = Arc::new(AtomicBool::new(false));

        let handle = {
            let gate = Arc::clone(&gate);
            let flag = Arc::clone(&flag);
            thread::spawn(move || gate.wait_until(None, || flag.load(Ordering::Acquire)))
        };

        flag.store(true, Ordering::Release);
        gate.notify_all();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn gate_deadline() {
        let gate = Gate::new();
        let deadline = Instant::now() + Duration::from_millis(5);
        assert!(!gate.wait_until(Some(deadline), || false));
    }
}
