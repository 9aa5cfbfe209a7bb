// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::num::NonZeroU32;

/// An index/generation pair referring to a pooled descriptor.
///
/// The index names a pool slot, the generation is bumped every time the slot
/// is released so that stale handles fail lookup instead of aliasing a
/// recycled descriptor. Generations start at 1, which keeps the packed
/// representation non-zero and lets queues use `0` as an empty marker.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RawHandle {
    pub(crate) index: u32,
    pub(crate) generation: NonZeroU32,
}

impl RawHandle {
    pub(crate) fn pack(self) -> u64 {
        (u64::from(self.generation.get()) << 32) | u64::from(self.index)
    }

    pub(crate) fn unpack(raw: u64) -> Option<Self> {
        #[expect(clippy::cast_possible_truncation, reason = "intentional split")]
        let generation = NonZeroU32::new((raw >> 32) as u32)?;
        #[expect(clippy::cast_possible_truncation, reason = "intentional split")]
        let index = raw as u32;
        Some(Self { index, generation })
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) RawHandle);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }
    };
}

typed_handle! {
    /// Opaque reference to a submitted task.
    TaskHandle
}
typed_handle! {
    /// Opaque reference to a completion group.
    GroupHandle
}
typed_handle! {
    /// Opaque reference to a task queue.
    QueueHandle
}
typed_handle! {
    /// Opaque reference to a registered action.
    ActionHandle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trips() {
        let handle = RawHandle {
            index: 513,
            generation: NonZeroU32::new(7).unwrap(),
        };
        assert_eq!(RawHandle::unpack(handle.pack()), Some(handle));
    }

    #[test]
    fn zero_is_not_a_handle() {
        assert_eq!(RawHandle::unpack(0), None);
    }
}
