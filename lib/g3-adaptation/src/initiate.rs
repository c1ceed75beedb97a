/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::rc::Rc;

use log::debug;

use g3_async_job::{Job, JobContext, JobHandle, JobId};

use crate::AdaptationAnswer;

/// Why a transaction gave up, as seen by whoever launched it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XactAbortInfo {
    /// Nothing was lost, the same request may be sent again.
    pub retriable: bool,
}

/// A job that starts adaptations and waits for their answers.
pub trait Initiator: Job {
    fn note_adaptation_answer(
        &mut self,
        ctx: &mut JobContext<'_>,
        answer: AdaptationAnswer,
    ) -> anyhow::Result<()>;

    fn note_adaptation_query_abort(
        &mut self,
        ctx: &mut JobContext<'_>,
        is_final: bool,
    ) -> anyhow::Result<()>;

    fn note_xact_abort(
        &mut self,
        ctx: &mut JobContext<'_>,
        info: XactAbortInfo,
    ) -> anyhow::Result<()> {
        self.note_adaptation_query_abort(ctx, !info.retriable)
    }
}

pub(crate) trait InitiatorLink {
    fn job_id(&self) -> JobId;
    fn answer(&self, answer: AdaptationAnswer);
    fn query_aborted(&self, is_final: bool);
    fn xact_aborted(&self, info: XactAbortInfo);
}

impl<I: Initiator> InitiatorLink for JobHandle<I> {
    fn job_id(&self) -> JobId {
        self.id()
    }

    fn answer(&self, answer: AdaptationAnswer) {
        self.call("Initiator::noteAdaptationAnswer", move |i, ctx| {
            i.note_adaptation_answer(ctx, answer)
        });
    }

    fn query_aborted(&self, is_final: bool) {
        self.call("Initiator::noteAdaptationQueryAbort", move |i, ctx| {
            i.note_adaptation_query_abort(ctx, is_final)
        });
    }

    fn xact_aborted(&self, info: XactAbortInfo) {
        self.call("Initiator::noteXactAbort", move |i, ctx| {
            i.note_xact_abort(ctx, info)
        });
    }
}

/// A job that works on behalf of an [`Initiator`].
pub trait Initiate: Job {
    fn initiate_core(&mut self) -> &mut InitiateCore;

    fn note_initiator_aborted(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let core = self.initiate_core();
        if core.has_initiator() {
            core.clear_initiator();
            ctx.must_stop("initiator aborted");
        }
        Ok(())
    }
}

trait InitiateLink {
    fn job_id(&self) -> JobId;
    fn valid(&self) -> bool;
    fn initiator_aborted(&self);
}

impl<T: Initiate> InitiateLink for JobHandle<T> {
    fn job_id(&self) -> JobId {
        self.id()
    }

    fn valid(&self) -> bool {
        JobHandle::valid(self)
    }

    fn initiator_aborted(&self) {
        self.call("Initiate::noteInitiatorAborted", |t, ctx| {
            t.note_initiator_aborted(ctx)
        });
    }
}

/// What an initiator keeps of a started adaptation.
#[derive(Clone)]
pub struct InitiateHandle {
    link: Rc<dyn InitiateLink>,
}

impl InitiateHandle {
    pub fn new<T: Initiate>(handle: JobHandle<T>) -> Self {
        InitiateHandle {
            link: Rc::new(handle),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.link.job_id()
    }

    pub fn valid(&self) -> bool {
        self.link.valid()
    }

    /// Tell the adaptation nobody waits for it any more and forget it.
    pub fn announce_initiator_abort(slot: &mut Option<InitiateHandle>) {
        if let Some(x) = slot.take() {
            debug!("announcing initiator abort to {}", x.job_id());
            x.link.initiator_aborted();
        }
    }
}

/// The initiator side state shared by all initiates.
#[derive(Default)]
pub struct InitiateCore {
    initiator: Option<Rc<dyn InitiatorLink>>,
}

impl InitiateCore {
    pub fn for_initiator<I: Initiator>(initiator: &JobHandle<I>) -> Self {
        InitiateCore {
            initiator: Some(Rc::new(initiator.clone())),
        }
    }

    #[inline]
    pub fn has_initiator(&self) -> bool {
        self.initiator.is_some()
    }

    pub fn clear_initiator(&mut self) {
        self.initiator = None;
    }

    /// Deliver the answer. There is only ever one, so the initiator is
    /// forgotten afterwards.
    pub fn send_answer(&mut self, answer: AdaptationAnswer) {
        match self.initiator.take() {
            Some(i) => i.answer(answer),
            None => debug!("no initiator to send {answer:?} to"),
        }
    }

    pub fn tell_query_aborted(&mut self, is_final: bool) {
        if let Some(i) = self.initiator.take() {
            debug!("telling {} the query is aborted, final: {is_final}", i.job_id());
            i.query_aborted(is_final);
        }
    }

    pub fn tell_xact_aborted(&mut self, info: XactAbortInfo) {
        if let Some(i) = self.initiator.take() {
            debug!(
                "telling {} the transaction is aborted, retriable: {}",
                i.job_id(),
                info.retriable
            );
            i.xact_aborted(info);
        }
    }

    /// An initiate dying without an answer owes a final abort.
    pub fn swan_song(&mut self) {
        if self.initiator.is_some() {
            debug!("fatal failure, sending abort notification");
            self.tell_query_aborted(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use g3_async_job::EventLoop;
    use g3_http::{HttpHead, HttpProtocol};

    use crate::{AdaptationMessage, AdaptationOutcome};

    #[derive(Default)]
    struct Seen {
        answers: Vec<AdaptationOutcome>,
        aborts: Vec<bool>,
    }

    struct Waiter {
        seen: Rc<RefCell<Seen>>,
    }

    impl Job for Waiter {
        fn start(&mut self, _ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        fn done_all(&self) -> bool {
            false
        }
    }

    impl Initiator for Waiter {
        fn note_adaptation_answer(
            &mut self,
            _ctx: &mut JobContext<'_>,
            answer: AdaptationAnswer,
        ) -> anyhow::Result<()> {
            if let AdaptationAnswer::Forward { outcome, .. } = answer {
                self.seen.borrow_mut().answers.push(outcome);
            }
            Ok(())
        }

        fn note_adaptation_query_abort(
            &mut self,
            _ctx: &mut JobContext<'_>,
            is_final: bool,
        ) -> anyhow::Result<()> {
            self.seen.borrow_mut().aborts.push(is_final);
            Ok(())
        }
    }

    struct Worker {
        core: InitiateCore,
        answer: bool,
    }

    impl Job for Worker {
        fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
            if self.answer {
                let head = HttpHead::new_response(HttpProtocol::Http11, 200, "OK");
                self.core.send_answer(AdaptationAnswer::Forward {
                    message: AdaptationMessage::new(head, None),
                    outcome: AdaptationOutcome::Unmodified,
                });
            } else {
                ctx.must_stop("no luck");
            }
            Ok(())
        }

        fn done_all(&self) -> bool {
            !self.core.has_initiator()
        }

        fn swan_song(&mut self, _ctx: &mut JobContext<'_>) {
            self.core.swan_song();
        }
    }

    impl Initiate for Worker {
        fn initiate_core(&mut self) -> &mut InitiateCore {
            &mut self.core
        }
    }

    #[test]
    fn answer_then_done() {
        let ev = EventLoop::with_manual_clock();
        let seen = Rc::new(RefCell::new(Seen::default()));
        let waiter = ev.scheduler().start_job(Waiter { seen: seen.clone() });
        ev.scheduler().start_job(Worker {
            core: InitiateCore::for_initiator(&waiter),
            answer: true,
        });
        ev.run_until_idle();
        assert_eq!(seen.borrow().answers, [AdaptationOutcome::Unmodified]);
        assert!(seen.borrow().aborts.is_empty());
        assert_eq!(ev.job_count(), 1);
    }

    #[test]
    fn silent_death_is_final_abort() {
        let ev = EventLoop::with_manual_clock();
        let seen = Rc::new(RefCell::new(Seen::default()));
        let waiter = ev.scheduler().start_job(Waiter { seen: seen.clone() });
        ev.scheduler().start_job(Worker {
            core: InitiateCore::for_initiator(&waiter),
            answer: false,
        });
        ev.run_until_idle();
        assert!(seen.borrow().answers.is_empty());
        assert_eq!(seen.borrow().aborts, [true]);
    }

    #[test]
    fn initiator_abort_stops_worker() {
        let ev = EventLoop::with_manual_clock();
        let seen = Rc::new(RefCell::new(Seen::default()));
        let waiter = ev.scheduler().start_job(Waiter { seen: seen.clone() });
        let worker = ev.scheduler().start_job(Worker {
            core: InitiateCore::for_initiator(&waiter),
            answer: false,
        });
        let mut slot = Some(InitiateHandle::new(worker.clone()));
        InitiateHandle::announce_initiator_abort(&mut slot);
        assert!(slot.is_none());
        ev.run_until_idle();
        assert!(!worker.valid());
        // the worker stopped in start() and told the waiter first
        assert_eq!(seen.borrow().aborts, [true]);
    }
}
