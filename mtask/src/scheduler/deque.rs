// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bounded Chase–Lev work-stealing deque of packed task handles.
//!
//! The owning worker pushes and pops at the bottom (LIFO, for locality);
//! thieves take from the top (FIFO) with a CAS on the top index. Entries are
//! packed [`RawHandle`](crate::handle::RawHandle)s, which are plain `u64`s,
//! so slots can be relaxed atomics and the usual torn-read hazard of the
//! algorithm disappears.
//!
//! The buffer does not grow: `push` reports a full deque and the caller
//! falls back to the scheduler's injector.

use crate::loom::sync::atomic::{AtomicI64, AtomicU64, Ordering, fence};

pub(crate) struct Deque {
    /// Index of the oldest entry; incremented by successful steals.
    top: AtomicI64,
    /// Index one past the youngest entry; only the owner writes this.
    bottom: AtomicI64,
    buffer: Box<[AtomicU64]>,
    mask: i64,
}

/// Outcome of a steal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Steal {
    Stolen(u64),
    Empty,
    /// Lost a race against the owner or another thief; worth retrying.
    Retry,
}

// === impl Deque ===

impl Deque {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        assert!(capacity <= 1 << 32);

        let buffer = (0..capacity)
            .map(|_| AtomicU64::new(0))
            .collect::<Box<[_]>>();

        Self {
            top: AtomicI64::new(0),
            bottom: AtomicI64::new(0),
            buffer,
            #[expect(clippy::cast_possible_wrap, reason = "capacity bounded above")]
            mask: capacity as i64 - 1,
        }
    }

    /// Approximate occupancy; exact only from the owner's point of view.
    pub(crate) fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        usize::try_from((b - t).max(0)).unwrap_or(0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(&self, index: i64) -> &AtomicU64 {
        #[expect(clippy::cast_sign_loss, reason = "masked to buffer range")]
        &self.buffer[(index & self.mask) as usize]
    }

    /// Appends an entry at the bottom. Owner only.
    pub(crate) fn push(&self, entry: u64) -> Result<(), Full> {
        debug_assert_ne!(entry, 0, "0 is not a packed handle");

        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b - t > self.mask {
            return Err(Full(entry));
        }

        self.slot(b).store(entry, Ordering::Relaxed);
        self.bottom.store(b + 1, Ordering::Release);
        Ok(())
    }

    /// Takes the youngest entry. Owner only.
    pub(crate) fn pop(&self) -> Option<u64> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // deque was empty; undo
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let entry = self.slot(b).load(Ordering::Relaxed);
        if t == b {
            // last entry: race against thieves for it
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            return won.then_some(entry);
        }

        Some(entry)
    }

    /// Takes the oldest entry on behalf of another worker.
    pub(crate) fn steal(&self) -> Steal {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return Steal::Empty;
        }

        let entry = self.slot(t).load(Ordering::Relaxed);
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Steal::Stolen(entry)
        } else {
            Steal::Retry
        }
    }
}

/// Returned by [`Deque::push`] with the rejected entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Full(pub(crate) u64);
