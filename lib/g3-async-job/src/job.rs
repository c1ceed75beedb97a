/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::time::Instant;

use anyhow::anyhow;
use log::{debug, trace, warn};

use crate::scheduler::JobUnavailable;
use crate::{AsyncCall, AsyncCallback, Scheduler, WeakScheduler};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobId {
    index: u32,
    generation: u32,
}

impl JobId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        JobId { index, generation }
    }

    #[inline]
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job{}.{}", self.index, self.generation)
    }
}

/// A cooperatively scheduled, safely destructible actor.
pub trait Job: Any {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()>;

    /// Positive completion predicate, checked at the end of every call.
    fn done_all(&self) -> bool;

    /// Called at the end of every call, before the done check.
    fn call_end(&mut self, _ctx: &mut JobContext<'_>) {}

    /// Last chance cleanup before the job is destroyed.
    fn swan_song(&mut self, _ctx: &mut JobContext<'_>) {}

    /// Handle an error that escaped a call.
    fn call_exception(&mut self, ctx: &mut JobContext<'_>, e: anyhow::Error) {
        ctx.must_stop(format!("exception: {e:#}"));
    }

    fn status(&self) -> String {
        String::new()
    }
}

pub(crate) struct JobBase {
    id: JobId,
    type_name: &'static str,
    stop_reason: Option<String>,
}

impl JobBase {
    pub(crate) fn new(id: JobId, type_name: &'static str) -> Self {
        JobBase {
            id,
            type_name,
            stop_reason: None,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    #[inline]
    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[inline]
    pub(crate) fn stopping(&self) -> bool {
        self.stop_reason.is_some()
    }

    pub(crate) fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }
}

/// What a job sees of the loop while one of its calls is running.
pub struct JobContext<'a> {
    base: &'a mut JobBase,
    sched: &'a Scheduler,
    call_name: &'static str,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(base: &'a mut JobBase, sched: &'a Scheduler, call_name: &'static str) -> Self {
        JobContext {
            base,
            sched,
            call_name,
        }
    }

    #[inline]
    pub fn id(&self) -> JobId {
        self.base.id
    }

    #[inline]
    pub fn call_name(&self) -> &'static str {
        self.call_name
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        self.sched
    }

    pub fn now(&self) -> Instant {
        self.sched.now()
    }

    /// A typed handle to the job running this call.
    ///
    /// The type is checked when a call is made through the handle.
    pub fn handle<J: Job>(&self) -> JobHandle<J> {
        JobHandle::new(self.base.id, self.sched.downgrade())
    }

    /// Request the job to stop at the end of the current call.
    pub fn must_stop<S: Into<String>>(&mut self, reason: S) {
        let reason = reason.into();
        match &self.base.stop_reason {
            Some(first) => {
                if *first != reason {
                    debug!(
                        "{} {} is already stopping ({first}), ignoring: {reason}",
                        self.base.type_name, self.base.id
                    );
                }
            }
            None => {
                debug!(
                    "{} {} must stop in {}: {reason}",
                    self.base.type_name, self.base.id, self.call_name
                );
                self.base.stop_reason = Some(reason);
            }
        }
    }

    #[inline]
    pub fn stopping(&self) -> bool {
        self.base.stopping()
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.base.stop_reason()
    }
}

/// A weak handle to a started job.
pub struct JobHandle<J> {
    id: JobId,
    sched: WeakScheduler,
    _job: PhantomData<fn() -> J>,
}

impl<J> Clone for JobHandle<J> {
    fn clone(&self) -> Self {
        JobHandle {
            id: self.id,
            sched: self.sched.clone(),
            _job: PhantomData,
        }
    }
}

impl<J> fmt::Debug for JobHandle<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JobHandle").field(&self.id).finish()
    }
}

impl<J: Job> JobHandle<J> {
    pub(crate) fn new(id: JobId, sched: WeakScheduler) -> Self {
        JobHandle {
            id,
            sched,
            _job: PhantomData,
        }
    }

    #[inline]
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn weak_scheduler(&self) -> &WeakScheduler {
        &self.sched
    }

    pub fn valid(&self) -> bool {
        self.sched
            .upgrade()
            .is_some_and(|sched| sched.is_job_alive(self.id))
    }

    /// Build a call that will be dialed through the enter/exit wrapper.
    pub fn async_call<F>(&self, name: &'static str, f: F) -> AsyncCall
    where
        F: FnOnce(&mut J, &mut JobContext<'_>) -> anyhow::Result<()> + 'static,
    {
        let handle = self.clone();
        AsyncCall::new(name, move || {
            handle.dial(name, f);
        })
    }

    /// Queue a call to the job. Returns false if the loop is gone.
    pub fn call<F>(&self, name: &'static str, f: F) -> bool
    where
        F: FnOnce(&mut J, &mut JobContext<'_>) -> anyhow::Result<()> + 'static,
    {
        self.sched.schedule(self.async_call(name, f))
    }

    /// Build a callback that, once given its argument, calls the job.
    pub fn callback<A, F>(&self, name: &'static str, f: F) -> AsyncCallback<A>
    where
        A: 'static,
        F: FnOnce(&mut J, &mut JobContext<'_>, A) -> anyhow::Result<()> + 'static,
    {
        let handle = self.clone();
        AsyncCallback::new(name, self.sched.clone(), move |arg| {
            handle.dial(name, move |job, ctx| f(job, ctx, arg));
        })
    }

    /// Make the call right now through the enter/exit wrapper.
    ///
    /// Returns false if the job is gone or already inside a call.
    pub fn dial<F>(&self, name: &'static str, f: F) -> bool
    where
        F: FnOnce(&mut J, &mut JobContext<'_>) -> anyhow::Result<()>,
    {
        let Some(sched) = self.sched.upgrade() else {
            debug!("will not call {name}: event loop is gone");
            return false;
        };
        let (mut job, mut base) = match sched.checkout_job(self.id) {
            Ok(v) => v,
            Err(JobUnavailable::Gone) => {
                debug!("will not call {name}: {} is gone", self.id);
                return false;
            }
            Err(JobUnavailable::Busy) => {
                warn!("will not call {name}: {} is already inside a call", self.id);
                return false;
            }
        };

        trace!("entering {name} for {} {}", base.type_name(), self.id);
        {
            let mut ctx = JobContext::new(&mut base, &sched, name);
            let r = match (&mut *job as &mut dyn Any).downcast_mut::<J>() {
                Some(j) => f(j, &mut ctx),
                None => Err(anyhow!(
                    "{} is not a {}",
                    self.id,
                    std::any::type_name::<J>()
                )),
            };
            if let Err(e) = r {
                warn!(
                    "{} {} caught exception in {name}: {e:#}",
                    ctx.base.type_name, self.id
                );
                job.call_exception(&mut ctx, e);
            }
        }
        trace!("leaving {name} for {} {}", base.type_name(), self.id);

        sched.finish_call(job, base);
        true
    }
}
