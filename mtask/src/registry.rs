// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The job table: maps job ids to registered actions.
//!
//! A job is just a number the application picked; what runs is one of the
//! actions registered under it. Several actions may share a job id (local
//! function, remote back-end, accelerator kernel) and dispatch picks the
//! first *enabled* one whose affinity is compatible with the submission, in
//! registration order.

use crate::affinity::AffinitySet;
use crate::error::Error;
use crate::handle::{ActionHandle, RawHandle};
use crate::loom::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::pool::Pool;
use crate::task::TaskContext;
use core::any::Any;
use core::fmt;
use core::mem;
use std::sync::Arc;

/// The signature of a registered action function.
pub type ActionFn = dyn Fn(&TaskContext<'_>) + Send + Sync;

/// Application-chosen identifier of an operation.
///
/// Job ids index the node's job table; ids at or above the configured job
/// capacity are rejected.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct JobId(pub u32);

impl JobId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Options for [`Node::register_action`](crate::Node::register_action).
#[derive(Clone, Default)]
pub struct ActionOptions {
    pub(crate) affinity: AffinitySet,
    pub(crate) node_local: Option<Arc<dyn Any + Send + Sync>>,
}

// === impl ActionOptions ===

impl ActionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the action to the given workers. Submissions whose affinity
    /// does not overlap this set will not select the action.
    pub fn affinity(mut self, affinity: AffinitySet) -> Self {
        self.affinity = affinity;
        self
    }

    /// Attaches shared data handed to every invocation through
    /// [`TaskContext::node_local`](crate::TaskContext::node_local).
    pub fn node_local(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.node_local = Some(data);
        self
    }
}

impl fmt::Debug for ActionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionOptions")
            .field("affinity", &self.affinity)
            .field("node_local", &self.node_local.is_some())
            .finish()
    }
}

/// Pooled descriptor of one registered action.
pub(crate) struct ActionDesc {
    enabled: AtomicBool,
    affinity: AtomicU64,
    inner: spin::Mutex<ActionInner>,
}

#[derive(Default)]
struct ActionInner {
    job: JobId,
    func: Option<Arc<ActionFn>>,
    node_local: Option<Arc<dyn Any + Send + Sync>>,
}

// === impl ActionDesc ===

impl ActionDesc {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            affinity: AtomicU64::new(0),
            inner: spin::Mutex::new(ActionInner::default()),
        }
    }

    fn recycle(&self) {
        self.enabled.store(false, Ordering::Release);
        self.affinity.store(0, Ordering::Release);
        *self.inner.lock() = ActionInner::default();
    }
}

/// Everything dispatch needs from a resolved action, cloned out so the
/// action may be deleted while tasks using it are still in flight.
#[derive(Clone)]
pub(crate) struct ResolvedAction {
    pub(crate) func: Arc<ActionFn>,
    pub(crate) node_local: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for ResolvedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAction")
            .field("func", &(Arc::as_ptr(&self.func)))
            .field("node_local", &self.node_local.is_some())
            .finish()
    }
}

pub(crate) struct Registry {
    jobs: Box<[JobEntry]>,
    actions: Pool<ActionDesc>,
}

struct JobEntry {
    /// Action handles in registration order; the order is the documented
    /// tie-break.
    actions: spin::Mutex<Vec<RawHandle>>,
}

// === impl Registry ===

impl Registry {
    pub(crate) fn new(job_capacity: usize, action_capacity: usize) -> Self {
        let jobs = (0..job_capacity)
            .map(|_| JobEntry {
                actions: spin::Mutex::new(Vec::new()),
            })
            .collect::<Box<[_]>>();

        crate::alloc::record_alloc(job_capacity * mem::size_of::<JobEntry>());

        Self {
            jobs,
            actions: Pool::with_capacity(action_capacity, |_| ActionDesc::new()),
        }
    }

    pub(crate) fn register(
        &self,
        job: JobId,
        options: ActionOptions,
        func: Arc<ActionFn>,
    ) -> Result<ActionHandle, Error> {
        let entry = self.jobs.get(job.0 as usize).ok_or(Error::UnknownJob)?;

        let (handle, desc) = self.actions.acquire()?;
        *desc.inner.lock() = ActionInner {
            job,
            func: Some(func),
            node_local: options.node_local,
        };
        desc.affinity.store(options.affinity.to_bits(), Ordering::Release);
        desc.enabled.store(true, Ordering::Release);

        entry.actions.lock().push(handle);

        tracing::debug!(job = ?job, action = ?handle, "registered action");
        Ok(ActionHandle(handle))
    }

    pub(crate) fn delete(&self, handle: ActionHandle) -> Result<(), Error> {
        let desc = self.actions.lookup(handle.0)?;
        desc.enabled.store(false, Ordering::Release);

        let job = desc.inner.lock().job;
        if let Some(entry) = self.jobs.get(job.0 as usize) {
            entry.actions.lock().retain(|h| *h != handle.0);
        }

        // in-flight tasks hold their own clone of the function, so the
        // descriptor can be recycled right away
        desc.recycle();
        self.actions.release(handle.0)?;

        tracing::debug!(action = ?handle, "deleted action");
        Ok(())
    }

    pub(crate) fn set_enabled(&self, handle: ActionHandle, enabled: bool) -> Result<(), Error> {
        let desc = self.actions.lookup(handle.0)?;
        desc.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    /// Selects the action to run for `job`: the first enabled action (in
    /// registration order) whose affinity overlaps the submission's.
    pub(crate) fn resolve(
        &self,
        job: JobId,
        affinity: &AffinitySet,
    ) -> Result<ResolvedAction, Error> {
        let entry = self.jobs.get(job.0 as usize).ok_or(Error::UnknownJob)?;

        let mut any_enabled = false;
        for handle in entry.actions.lock().iter() {
            let Ok(desc) = self.actions.lookup(*handle) else {
                continue;
            };
            if !desc.enabled.load(Ordering::Acquire) {
                continue;
            }
            any_enabled = true;

            let action_affinity = AffinitySet::from_bits(desc.affinity.load(Ordering::Acquire));
            if !action_affinity.overlaps(affinity) {
                continue;
            }

            let inner = desc.inner.lock();
            let Some(func) = inner.func.clone() else {
                continue;
            };
            return Ok(ResolvedAction {
                func,
                node_local: inner.node_local.clone(),
            });
        }

        if any_enabled {
            Err(Error::NoCompatibleAction)
        } else {
            Err(Error::UnknownJob)
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        crate::alloc::record_dealloc(self.jobs.len() * mem::size_of::<JobEntry>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<ActionFn> {
        Arc::new(|_ctx: &TaskContext<'_>| {})
    }

    #[test]
    fn unknown_job_without_actions() {
        let registry = Registry::new(4, 4);
        assert_eq!(
            registry
                .resolve(JobId::new(1), &AffinitySet::new())
                .unwrap_err(),
            Error::UnknownJob
        );
        assert_eq!(
            registry
                .resolve(JobId::new(99), &AffinitySet::new())
                .unwrap_err(),
            Error::UnknownJob
        );
    }

    #[test]
    fn first_compatible_action_wins() {
        let registry = Registry::new(4, 4);
        let job = JobId::new(2);

        let pinned = registry
            .register(
                job,
                ActionOptions::new().affinity(AffinitySet::only(3)),
                noop(),
            )
            .unwrap();
        let _general = registry.register(job, ActionOptions::new(), noop()).unwrap();

        // a submission restricted to worker 0 skips the pinned action
        assert!(registry.resolve(job, &AffinitySet::only(0)).is_ok());

        registry.delete(pinned).unwrap();
        assert!(registry.resolve(job, &AffinitySet::new()).is_ok());
    }

    #[test]
    fn disabled_actions_do_not_resolve() {
        let registry = Registry::new(4, 4);
        let job = JobId::new(0);

        let action = registry.register(job, ActionOptions::new(), noop()).unwrap();
        registry.set_enabled(action, false).unwrap();

        // all actions disabled reads as "no job" to submitters
        assert_eq!(
            registry.resolve(job, &AffinitySet::new()).unwrap_err(),
            Error::UnknownJob
        );

        registry.set_enabled(action, true).unwrap();
        assert!(registry.resolve(job, &AffinitySet::new()).is_ok());
    }

    #[test]
    fn incompatible_affinity_is_distinguished() {
        let registry = Registry::new(4, 4);
        let job = JobId::new(1);

        registry
            .register(
                job,
                ActionOptions::new().affinity(AffinitySet::only(5)),
                noop(),
            )
            .unwrap();

        assert_eq!(
            registry.resolve(job, &AffinitySet::only(1)).unwrap_err(),
            Error::NoCompatibleAction
        );
    }
}
