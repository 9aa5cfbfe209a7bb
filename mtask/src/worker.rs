// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::node::Node;
use crate::scheduler;
use std::sync::Arc;
use std::thread;

/// Spawns the OS thread backing worker `index`.
pub(crate) fn spawn(node: Arc<Node>, index: usize) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("mtask-worker-{index}"))
        .spawn(move || run(&node, index))
}

/// The worker main loop: dispatch until the node stops and no work remains.
fn run(node: &Node, index: usize) {
    scheduler::set_current_worker(Some(index));
    tracing::debug!(worker = index, "worker online");

    let sched = node.scheduler();
    loop {
        if let Some(packed) = sched.dispatch(index) {
            scheduler::run_entry(node, packed, index);
            continue;
        }

        // only exit once the stop flag is set *and* a full dispatch pass
        // (including stealing) came back empty, so teardown drains all
        // pending work
        if sched.is_stopping() {
            break;
        }

        sched.park(index);
    }

    scheduler::set_current_worker(None);
    tracing::debug!(worker = index, "worker offline");
}
