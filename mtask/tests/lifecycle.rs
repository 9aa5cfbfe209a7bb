// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Node lifecycle, waiting edge cases and error surfacing.

use core::num::NonZeroU32;
use lazy_static::lazy_static;
use mtask::{ActionOptions, AffinitySet, Error, JobId, Node, NodeAttributes, QueueAttributes};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

lazy_static! {
    static ref NODE_LOCK: Mutex<()> = Mutex::new(());
}

struct FinalizeOnDrop;

impl Drop for FinalizeOnDrop {
    fn drop(&mut self) {
        let _ = Node::finalize();
    }
}

fn with_node(attrs: NodeAttributes, f: impl FnOnce(&Node)) {
    let _serial: MutexGuard<'_, ()> = NODE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    Node::initialize(7, 3, attrs).unwrap();
    let guard = FinalizeOnDrop;
    {
        let node = Node::current().unwrap();
        f(&node);
    }
    drop(guard);

    assert_eq!(mtask::bytes_allocated(), 0);
}

#[derive(Clone)]
struct Latch(Arc<(Mutex<bool>, Condvar)>);

impl Latch {
    fn new() -> Self {
        Self(Arc::new((Mutex::new(false), Condvar::new())))
    }

    fn block_on(&self) {
        let (lock, cv) = &*self.0;
        let mut open = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            open = cv.wait(open).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn open(&self) {
        let (lock, cv) = &*self.0;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cv.notify_all();
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        self.open();
    }
}

#[test]
fn initialize_is_exclusive() {
    let _serial = NODE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    assert_eq!(Node::current().unwrap_err(), Error::NodeNotInitialized);
    assert_eq!(Node::finalize().unwrap_err(), Error::NodeNotInitialized);

    Node::initialize(1, 1, NodeAttributes::new()).unwrap();
    let _cleanup = FinalizeOnDrop;
    assert_eq!(
        Node::initialize(1, 1, NodeAttributes::new()).unwrap_err(),
        Error::NodeInitialized
    );

    let node = Node::current().unwrap();
    assert_eq!(node.domain_id(), 1);
    assert_eq!(node.node_id(), 1);
    assert!(node.num_workers() >= 1);
    // the test thread is not a worker
    assert_eq!(node.worker_index(), None);
    drop(node);

    Node::finalize().unwrap();
    assert_eq!(Node::finalize().unwrap_err(), Error::NodeNotInitialized);
    assert_eq!(mtask::bytes_allocated(), 0);
}

#[test]
fn submit_validation_errors() {
    const REAL: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(2), |node| {
        node.register_action(REAL, ActionOptions::new(), |_ctx| {}).unwrap();

        // nothing registered under this id
        assert_eq!(
            node.submit(JobId::new(2), &[]).unwrap_err(),
            Error::UnknownJob
        );
        // out of the job table entirely
        assert_eq!(
            node.submit(JobId::new(100_000), &[]).unwrap_err(),
            Error::UnknownJob
        );

        let task = node.submit(REAL, &[]).unwrap();
        node.wait(task, None).unwrap();
    });
}

#[test]
fn affinity_mismatch_is_distinguished() {
    const PINNED: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(2), |node| {
        node.register_action(
            PINNED,
            ActionOptions::new().affinity(AffinitySet::only(0)),
            |_ctx| {},
        )
        .unwrap();

        assert_eq!(
            node.task(PINNED)
                .affinity(AffinitySet::only(1))
                .submit()
                .unwrap_err(),
            Error::NoCompatibleAction
        );

        // overlapping affinity dispatches, and on the right worker
        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        let shared = Arc::clone(&observed);
        node.register_action(JobId::new(2), ActionOptions::new(), move |ctx| {
            shared.store(ctx.worker_index(), Ordering::Release);
        })
        .unwrap();

        let task = node
            .task(JobId::new(2))
            .affinity(AffinitySet::only(1))
            .submit()
            .unwrap();
        node.wait(task, None).unwrap();
        assert_eq!(observed.load(Ordering::Acquire), 1);
    });
}

#[test]
fn zero_timeout_polls_without_blocking() {
    const BLOCK: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(1), |node| {
        let latch = Latch::new();
        {
            let latch = latch.clone();
            node.register_action(BLOCK, ActionOptions::new(), move |_ctx| latch.block_on())
                .unwrap();
        }

        let task = node.submit(BLOCK, &[]).unwrap();
        assert_eq!(
            node.wait(task, Some(Duration::ZERO)).unwrap_err(),
            Error::Timeout
        );

        latch.open();
        node.wait(task, None).unwrap();
    });
}

#[test]
fn detached_tasks_reject_wait() {
    const NOP: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(1), |node| {
        let done = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&done);
        node.register_action(NOP, ActionOptions::new(), move |_ctx| {
            shared.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();

        let task = node.task(NOP).detached().submit().unwrap();
        // either the descriptor is still live (wait is refused) or it was
        // already reclaimed eagerly (the handle went stale)
        let err = node.wait(task, None).unwrap_err();
        assert!(matches!(err, Error::Detached | Error::InvalidHandle), "{err:?}");

        while done.load(Ordering::Acquire) == 0 {
            std::hint::spin_loop();
        }
    });
}

#[test]
fn waited_handles_go_stale() {
    const NOP: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(1), |node| {
        node.register_action(NOP, ActionOptions::new(), |_ctx| {}).unwrap();

        let task = node.submit(NOP, &[]).unwrap();
        node.wait(task, None).unwrap();

        // the wait consumed and retired the descriptor
        assert_eq!(node.wait(task, None).unwrap_err(), Error::InvalidHandle);
        assert_eq!(node.cancel(task).unwrap_err(), Error::InvalidHandle);
    });
}

#[test]
fn action_errors_surface_through_wait() {
    const PANICS: JobId = JobId::new(1);
    const SETS_STATUS: JobId = JobId::new(2);

    with_node(NodeAttributes::new().num_workers(1), |node| {
        node.register_action(PANICS, ActionOptions::new(), |_ctx| {
            panic!("deliberate test panic");
        })
        .unwrap();
        node.register_action(SETS_STATUS, ActionOptions::new(), |ctx| {
            ctx.set_status(Error::User(NonZeroU32::new(42).unwrap()));
        })
        .unwrap();

        let task = node.submit(PANICS, &[]).unwrap();
        assert_eq!(node.wait(task, None).unwrap_err(), Error::ActionPanicked);

        let task = node.submit(SETS_STATUS, &[]).unwrap();
        assert_eq!(
            node.wait(task, None).unwrap_err(),
            Error::User(NonZeroU32::new(42).unwrap())
        );
    });
}

#[test]
fn instances_run_with_distinct_instance_numbers() {
    const MULTI: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(4), |node| {
        let seen: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());

        let shared = Arc::clone(&seen);
        node.register_action(MULTI, ActionOptions::new(), move |ctx| {
            assert_eq!(ctx.num_instances(), 4);
            shared[ctx.instance_num() as usize].fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();

        let task = node.task(MULTI).instances(4).submit().unwrap();
        node.wait(task, None).unwrap();

        for (instance, count) in seen.iter().enumerate() {
            assert_eq!(count.load(Ordering::Acquire), 1, "instance {instance}");
        }
    });
}

#[test]
fn queue_disable_and_enable() {
    const NOP: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(2), |node| {
        node.register_action(NOP, ActionOptions::new(), |_ctx| {}).unwrap();

        // queues are bound to a job with a registered action
        assert_eq!(
            node.create_queue(JobId::new(9), QueueAttributes::new())
                .unwrap_err(),
            Error::UnknownJob
        );

        let queue = node.create_queue(NOP, QueueAttributes::new()).unwrap();

        node.queue_disable(queue).unwrap();
        assert_eq!(
            node.task(NOP).queue(queue).submit().unwrap_err(),
            Error::QueueDisabled
        );

        node.queue_enable(queue).unwrap();
        let task = node.task(NOP).queue(queue).submit().unwrap();
        node.wait(task, None).unwrap();

        node.queue_delete(queue).unwrap();
        assert_eq!(node.queue_disable(queue).unwrap_err(), Error::InvalidHandle);
    });
}

#[test]
fn queue_rejects_foreign_jobs() {
    const A: JobId = JobId::new(1);
    const B: JobId = JobId::new(2);

    with_node(NodeAttributes::new().num_workers(1), |node| {
        node.register_action(A, ActionOptions::new(), |_ctx| {}).unwrap();
        node.register_action(B, ActionOptions::new(), |_ctx| {}).unwrap();

        let queue = node.create_queue(A, QueueAttributes::new()).unwrap();
        assert_eq!(
            node.task(B).queue(queue).submit().unwrap_err(),
            Error::UnknownJob
        );

        node.queue_delete(queue).unwrap();
    });
}

#[test]
fn group_delete_while_busy_fails_fast() {
    const BLOCK: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(1), |node| {
        let latch = Latch::new();
        {
            let latch = latch.clone();
            node.register_action(BLOCK, ActionOptions::new(), move |_ctx| latch.block_on())
                .unwrap();
        }

        let group = node.create_group().unwrap();
        let task = node.task(BLOCK).group(group).submit().unwrap();

        assert_eq!(node.group_delete(group).unwrap_err(), Error::Busy);

        latch.open();
        node.group_wait_all(group, None).unwrap();
        node.group_delete(group).unwrap();

        // the group drain retired the descriptor
        assert_eq!(node.wait(task, None).unwrap_err(), Error::InvalidHandle);
    });
}

#[test]
fn completion_callback_reports_status() {
    const NOP: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(1), |node| {
        node.register_action(NOP, ActionOptions::new(), |_ctx| {}).unwrap();

        let observed = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&observed);

        let task = node
            .task(NOP)
            .on_complete(move |task, status| {
                *shared.lock().unwrap_or_else(PoisonError::into_inner) = Some((task, status));
            })
            .submit()
            .unwrap();
        node.wait(task, None).unwrap();

        // the callback runs on the worker; the wait can return a beat before
        // it finishes writing
        loop {
            let observed = observed.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(seen) = *observed {
                assert_eq!(seen, (task, Ok(())));
                break;
            }
            drop(observed);
            std::hint::spin_loop();
        }
    });
}

#[test]
fn pinned_tasks_run_on_named_worker_only() {
    const WHOAMI: JobId = JobId::new(1);

    with_node(NodeAttributes::new().num_workers(3), |node| {
        let workers = Arc::new(Mutex::new(Vec::new()));

        let shared = Arc::clone(&workers);
        node.register_action(WHOAMI, ActionOptions::new(), move |ctx| {
            shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(ctx.worker_index());
        })
        .unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                node.task(WHOAMI)
                    .affinity(AffinitySet::only(2))
                    .submit()
                    .unwrap()
            })
            .collect();

        for task in tasks {
            node.wait(task, None).unwrap();
        }

        let workers = workers.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(workers.len(), 8);
        assert!(workers.iter().all(|w| *w == 2), "{workers:?}");
    });
}
