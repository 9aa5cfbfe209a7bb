// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded recycling pools for descriptor objects.
//!
//! Descriptors (tasks, groups, queues, actions) live in fixed-capacity slot
//! arrays allocated once at node bring-up. A slot is claimed with a CAS and
//! handed out as an index/generation [`RawHandle`]; releasing it bumps the
//! generation so every previously issued handle goes stale. Descriptor
//! memory itself is recycled in place through the descriptor's own interior
//! mutability and is only freed when the pool is dropped at node teardown.

use crate::error::Error;
use crate::handle::RawHandle;
use crate::loom::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use core::mem;
use core::num::NonZeroU32;

pub(crate) struct Pool<T> {
    slots: Box<[Slot<T>]>,
    /// Rotating start point for the free-slot scan, so concurrent acquirers
    /// spread out instead of fighting over slot 0.
    hint: AtomicUsize,
}

struct Slot<T> {
    in_use: AtomicBool,
    generation: AtomicU32,
    value: T,
}

// === impl Pool ===

impl<T> Pool<T> {
    pub(crate) fn with_capacity(capacity: usize, mut init: impl FnMut(u32) -> T) -> Self {
        assert!(capacity > 0 && capacity <= u32::MAX as usize);

        let slots = (0..capacity)
            .map(|index| Slot {
                in_use: AtomicBool::new(false),
                generation: AtomicU32::new(1),
                #[expect(clippy::cast_possible_truncation, reason = "capacity checked above")]
                value: init(index as u32),
            })
            .collect::<Box<[_]>>();

        crate::alloc::record_alloc(capacity * mem::size_of::<Slot<T>>());

        Self {
            slots,
            hint: AtomicUsize::new(0),
        }
    }

    /// Claims a free slot, returning its handle and a reference to the
    /// recycled descriptor.
    pub(crate) fn acquire(&self) -> Result<(RawHandle, &T), Error> {
        let start = self.hint.fetch_add(1, Ordering::Relaxed) % self.slots.len();

        for i in 0..self.slots.len() {
            let index = (start + i) % self.slots.len();
            let slot = &self.slots[index];

            if slot
                .in_use
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // the releaser bumps the generation *before* clearing
                // `in_use`, so this read is stable for as long as we hold
                // the slot.
                let generation = slot.generation.load(Ordering::Acquire);
                let handle = RawHandle {
                    #[expect(clippy::cast_possible_truncation, reason = "capacity fits u32")]
                    index: index as u32,
                    generation: NonZeroU32::new(generation)
                        .expect("slot generation must never be zero"),
                };

                tracing::trace!(handle = ?handle, "pool acquire");
                return Ok((handle, &slot.value));
            }
        }

        Err(Error::PoolExhausted)
    }

    /// Resolves `handle` to its descriptor, failing on stale generations.
    pub(crate) fn lookup(&self, handle: RawHandle) -> Result<&T, Error> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(Error::InvalidHandle)?;

        if !slot.in_use.load(Ordering::Acquire)
            || slot.generation.load(Ordering::Acquire) != handle.generation.get()
        {
            return Err(Error::InvalidHandle);
        }

        Ok(&slot.value)
    }

    /// Returns the slot named by `handle` to the freelist.
    ///
    /// The caller must have reset the descriptor through its interior
    /// mutability first; after this call the slot may be re-acquired at any
    /// moment. The generation is bumped before `in_use` is cleared so that
    /// in-flight handles go stale before the slot becomes claimable.
    pub(crate) fn release(&self, handle: RawHandle) -> Result<(), Error> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(Error::InvalidHandle)?;

        if !slot.in_use.load(Ordering::Acquire)
            || slot.generation.load(Ordering::Acquire) != handle.generation.get()
        {
            return Err(Error::InvalidHandle);
        }

        tracing::trace!(handle = ?handle, "pool release");

        let next = handle.generation.get().wrapping_add(1).max(1);
        slot.generation.store(next, Ordering::Release);
        slot.in_use.store(false, Ordering::Release);
        Ok(())
    }

    /// Visits every live descriptor. Used during teardown to drain whatever
    /// the application left behind.
    pub(crate) fn for_each_live(&self, mut f: impl FnMut(RawHandle, &T)) {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.in_use.load(Ordering::Acquire) {
                let Some(generation) = NonZeroU32::new(slot.generation.load(Ordering::Acquire))
                else {
                    continue;
                };
                #[expect(clippy::cast_possible_truncation, reason = "capacity fits u32")]
                let handle = RawHandle {
                    index: index as u32,
                    generation,
                };
                f(handle, &slot.value);
            }
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        crate::alloc::record_dealloc(self.slots.len() * mem::size_of::<Slot<T>>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;

    #[test]
    fn acquire_release_cycle() {
        let pool = Pool::with_capacity(2, |_| ());

        let (a, _) = pool.acquire().unwrap();
        let (b, _) = pool.acquire().unwrap();
        assert_eq!(pool.acquire().unwrap_err(), Error::PoolExhausted);

        pool.release(a).unwrap();
        let (c, _) = pool.acquire().unwrap();

        // the slot was recycled under a fresh generation
        assert_eq!(a.index, c.index);
        assert_ne!(a.generation, c.generation);

        pool.release(b).unwrap();
        pool.release(c).unwrap();
    }

    #[test]
    fn stale_handles_fail_lookup() {
        let pool = Pool::with_capacity(1, |_| ());

        let (handle, _) = pool.acquire().unwrap();
        assert!(pool.lookup(handle).is_ok());

        pool.release(handle).unwrap();
        assert_eq!(pool.lookup(handle).unwrap_err(), Error::InvalidHandle);
        assert_eq!(pool.release(handle).unwrap_err(), Error::InvalidHandle);

        // even after the slot is claimed again, the old handle stays dead
        let (fresh, _) = pool.acquire().unwrap();
        assert_eq!(pool.lookup(handle).unwrap_err(), Error::InvalidHandle);
        assert!(pool.lookup(fresh).is_ok());
    }

    #[test]
    fn concurrent_acquire_is_exclusive() {
        loom::model(|| {
            let pool = Arc::new(Pool::with_capacity(1, |_| ()));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    loom::thread::spawn(move || pool.acquire().map(|(h, _)| h).ok())
                })
                .collect();

            let won: Vec<_> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();

            // exactly one thread may claim the single slot
            assert_eq!(won.len(), 1);
        });
    }
}
