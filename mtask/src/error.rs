// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::num::NonZeroU32;

/// Final outcome of a task, as observed through [`wait`].
///
/// [`wait`]: crate::Node::wait
pub type Status = Result<(), Error>;

/// Errors surfaced by the runtime.
///
/// Every public operation returns one of these instead of panicking; panics
/// are reserved for violated internal invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A handle did not resolve to a live descriptor (stale generation,
    /// out-of-range index, or the descriptor was already retired).
    InvalidHandle,
    /// No action has been registered for the requested job.
    UnknownJob,
    /// Actions exist for the job, but none is enabled with a compatible
    /// affinity.
    NoCompatibleAction,
    /// The task was submitted detached and cannot be waited on.
    Detached,
    /// The queue has been disabled and rejects new submissions.
    QueueDisabled,
    /// A descriptor pool is out of free slots.
    PoolExhausted,
    /// The operating system refused a resource the runtime needs (worker
    /// thread creation, most likely).
    NoMemory,
    /// `Node::initialize` was called while a node is already up.
    NodeInitialized,
    /// An operation requires an initialized node.
    NodeNotInitialized,
    /// The descriptor is still in use and cannot be deleted.
    Busy,
    /// A wait deadline was reached before the awaited event.
    Timeout,
    /// The task was cancelled before or during its run.
    Cancelled,
    /// The action function panicked; the panic was contained by the worker.
    ActionPanicked,
    /// A status set by the action itself through
    /// [`TaskContext::set_status`](crate::TaskContext::set_status).
    User(NonZeroU32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidHandle => f.write_str("handle does not resolve to a live descriptor"),
            Error::UnknownJob => f.write_str("no action registered for job"),
            Error::NoCompatibleAction => f.write_str("no enabled action with compatible affinity"),
            Error::Detached => f.write_str("task is detached and cannot be waited on"),
            Error::QueueDisabled => f.write_str("queue is disabled"),
            Error::PoolExhausted => f.write_str("descriptor pool exhausted"),
            Error::NoMemory => f.write_str("out of system resources"),
            Error::NodeInitialized => f.write_str("node is already initialized"),
            Error::NodeNotInitialized => f.write_str("node is not initialized"),
            Error::Busy => f.write_str("descriptor is still in use"),
            Error::Timeout => f.write_str("wait deadline reached"),
            Error::Cancelled => f.write_str("task was cancelled"),
            Error::ActionPanicked => f.write_str("action function panicked"),
            Error::User(code) => write!(f, "user status {code}"),
        }
    }
}

impl core::error::Error for Error {}

/// Task statuses travel through an atomic `u32` on the descriptor, so the
/// error kinds need a stable wire encoding. User statuses occupy the upper
/// range and carry their code verbatim.
pub(crate) const CODE_SUCCESS: u32 = 0;

const CODE_INVALID_HANDLE: u32 = 1;
const CODE_UNKNOWN_JOB: u32 = 2;
const CODE_NO_COMPATIBLE_ACTION: u32 = 3;
const CODE_DETACHED: u32 = 4;
const CODE_QUEUE_DISABLED: u32 = 5;
const CODE_POOL_EXHAUSTED: u32 = 6;
const CODE_NO_MEMORY: u32 = 13;
const CODE_NODE_INITIALIZED: u32 = 7;
const CODE_NODE_NOT_INITIALIZED: u32 = 8;
const CODE_BUSY: u32 = 9;
const CODE_TIMEOUT: u32 = 10;
const CODE_CANCELLED: u32 = 11;
const CODE_ACTION_PANICKED: u32 = 12;
const CODE_USER_BASE: u32 = 0x1000_0000;

impl Error {
    pub(crate) fn to_code(self) -> u32 {
        match self {
            Error::InvalidHandle => CODE_INVALID_HANDLE,
            Error::UnknownJob => CODE_UNKNOWN_JOB,
            Error::NoCompatibleAction => CODE_NO_COMPATIBLE_ACTION,
            Error::Detached => CODE_DETACHED,
            Error::QueueDisabled => CODE_QUEUE_DISABLED,
            Error::PoolExhausted => CODE_POOL_EXHAUSTED,
            Error::NoMemory => CODE_NO_MEMORY,
            Error::NodeInitialized => CODE_NODE_INITIALIZED,
            Error::NodeNotInitialized => CODE_NODE_NOT_INITIALIZED,
            Error::Busy => CODE_BUSY,
            Error::Timeout => CODE_TIMEOUT,
            Error::Cancelled => CODE_CANCELLED,
            Error::ActionPanicked => CODE_ACTION_PANICKED,
            Error::User(code) => CODE_USER_BASE.saturating_add(code.get()),
        }
    }

    pub(crate) fn from_code(code: u32) -> Status {
        match code {
            CODE_SUCCESS => Ok(()),
            CODE_INVALID_HANDLE => Err(Error::InvalidHandle),
            CODE_UNKNOWN_JOB => Err(Error::UnknownJob),
            CODE_NO_COMPATIBLE_ACTION => Err(Error::NoCompatibleAction),
            CODE_DETACHED => Err(Error::Detached),
            CODE_QUEUE_DISABLED => Err(Error::QueueDisabled),
            CODE_POOL_EXHAUSTED => Err(Error::PoolExhausted),
            CODE_NO_MEMORY => Err(Error::NoMemory),
            CODE_NODE_INITIALIZED => Err(Error::NodeInitialized),
            CODE_NODE_NOT_INITIALIZED => Err(Error::NodeNotInitialized),
            CODE_BUSY => Err(Error::Busy),
            CODE_TIMEOUT => Err(Error::Timeout),
            CODE_CANCELLED => Err(Error::Cancelled),
            CODE_ACTION_PANICKED => Err(Error::ActionPanicked),
            code => match NonZeroU32::new(code.wrapping_sub(CODE_USER_BASE)) {
                Some(user) => Err(Error::User(user)),
                // this can only happen if the status word was corrupted
                None => unreachable!("invalid status code {code:#x}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let errors = [
            Error::InvalidHandle,
            Error::UnknownJob,
            Error::NoCompatibleAction,
            Error::Detached,
            Error::QueueDisabled,
            Error::PoolExhausted,
            Error::NoMemory,
            Error::NodeInitialized,
            Error::NodeNotInitialized,
            Error::Busy,
            Error::Timeout,
            Error::Cancelled,
            Error::ActionPanicked,
            Error::User(NonZeroU32::new(7).unwrap()),
        ];

        for err in errors {
            assert_eq!(Error::from_code(err.to_code()), Err(err));
        }
        assert_eq!(Error::from_code(CODE_SUCCESS), Ok(()));
    }
}
