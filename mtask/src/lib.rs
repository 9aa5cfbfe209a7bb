// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multicore task-parallel runtime.
//!
//! Applications register **actions** under integer **job** ids, then submit
//! **tasks** — one execution of a job with argument bytes and a result
//! buffer. The [`Node`] dispatches tasks onto a fixed pool of worker
//! threads with work-stealing deques; **groups** aggregate completions of
//! many tasks and **queues** serialise them (or deliver their completions
//! in enqueue order while executing in parallel).
//!
//! ```no_run
//! use mtask::{JobId, Node, NodeAttributes, ActionOptions};
//!
//! const DOUBLE: JobId = JobId::new(1);
//!
//! Node::initialize(1, 1, NodeAttributes::new()).unwrap();
//! let node = Node::current().unwrap();
//!
//! node.register_action(DOUBLE, ActionOptions::new(), |ctx| {
//!     let n = u32::from_le_bytes(ctx.args().try_into().unwrap());
//!     ctx.write_result(&(n * 2).to_le_bytes());
//! })
//! .unwrap();
//!
//! let result = node.call(DOUBLE, &21u32.to_le_bytes()).unwrap();
//! assert_eq!(u32::from_le_bytes(result.as_slice().try_into().unwrap()), 42);
//!
//! drop(node);
//! Node::finalize().unwrap();
//! ```

mod affinity;
mod alloc;
mod error;
mod group;
mod handle;
pub(crate) mod loom;
mod node;
mod park;
mod pool;
mod queue;
mod registry;
mod scheduler;
mod task;
mod worker;

pub use affinity::{AffinitySet, MAX_WORKERS};
pub use alloc::bytes_allocated;
pub use error::{Error, Status};
pub use handle::{ActionHandle, GroupHandle, QueueHandle, TaskHandle};
pub use node::{Node, NodeAttributes};
pub use queue::QueueAttributes;
pub use registry::{ActionOptions, JobId};
pub use task::{CompletionFn, TaskAttributes, TaskBuilder, TaskContext};
