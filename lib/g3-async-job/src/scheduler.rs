/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::job::{JobBase, JobContext};
use crate::{AsyncCall, CallCanceller, Job, JobHandle, JobId};

enum SlotState {
    Vacant,
    Idle(Box<dyn Job>, JobBase),
    Busy,
}

struct JobSlot {
    generation: u32,
    state: SlotState,
}

enum Clock {
    System,
    Manual { base: Instant, offset: Duration },
}

impl Clock {
    fn now(&self) -> Instant {
        match self {
            Clock::System => Instant::now(),
            Clock::Manual { base, offset } => *base + *offset,
        }
    }
}

pub(crate) enum JobUnavailable {
    Gone,
    Busy,
}

pub(crate) struct LoopState {
    slots: Vec<JobSlot>,
    free_slots: Vec<u32>,
    live_jobs: usize,
    queue: VecDeque<AsyncCall>,
    timers: BTreeMap<(Instant, u64), AsyncCall>,
    next_call_id: u64,
    next_timer_id: u64,
    clock: Clock,
    shutting_down: bool,
}

impl LoopState {
    fn new(clock: Clock) -> Self {
        LoopState {
            slots: Vec::new(),
            free_slots: Vec::new(),
            live_jobs: 0,
            queue: VecDeque::new(),
            timers: BTreeMap::new(),
            next_call_id: 1,
            next_timer_id: 0,
            clock,
            shutting_down: false,
        }
    }

    fn insert_job(&mut self, job: Box<dyn Job>, type_name: &'static str) -> JobId {
        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.slots.push(JobSlot {
                    generation: 0,
                    state: SlotState::Vacant,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = JobId::new(index, slot.generation);
        slot.state = SlotState::Idle(job, JobBase::new(id, type_name));
        self.live_jobs += 1;
        id
    }

    fn slot_mut(&mut self, id: JobId) -> Option<&mut JobSlot> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
    }
}

/// A strong reference to the event loop state.
///
/// Only the loop itself and code running inside a call hold one; jobs keep
/// [`WeakScheduler`]s.
#[derive(Clone)]
pub struct Scheduler {
    state: Rc<RefCell<LoopState>>,
}

impl Scheduler {
    pub(crate) fn new(manual_clock: bool) -> Self {
        let clock = if manual_clock {
            Clock::Manual {
                base: Instant::now(),
                offset: Duration::ZERO,
            }
        } else {
            Clock::System
        };
        Scheduler {
            state: Rc::new(RefCell::new(LoopState::new(clock))),
        }
    }

    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            state: Rc::downgrade(&self.state),
        }
    }

    pub fn now(&self) -> Instant {
        self.state.borrow().clock.now()
    }

    /// Take ownership of the job and queue its `start()` as the next call.
    pub fn start_job<J: Job>(&self, job: J) -> JobHandle<J> {
        let type_name = job.type_name();
        let id = self.state.borrow_mut().insert_job(Box::new(job), type_name);
        debug!("starting {type_name} {id}");
        let handle = JobHandle::<J>::new(id, self.downgrade());
        self.schedule(handle.async_call("AsyncJob::start", |job, ctx| job.start(ctx)));
        handle
    }

    pub fn schedule(&self, mut call: AsyncCall) {
        let mut state = self.state.borrow_mut();
        call.set_id(state.next_call_id);
        state.next_call_id += 1;
        trace!("scheduling {call}");
        state.queue.push_back(call);
    }

    /// Queue the call once `delay` has passed on the loop clock.
    pub fn schedule_timer(&self, delay: Duration, mut call: AsyncCall) -> CallCanceller {
        let canceller = call.canceller();
        let mut state = self.state.borrow_mut();
        call.set_id(state.next_call_id);
        state.next_call_id += 1;
        let when = state.clock.now() + delay;
        let seq = state.next_timer_id;
        state.next_timer_id += 1;
        trace!("scheduling {call} after {delay:?}");
        state.timers.insert((when, seq), call);
        canceller
    }

    pub fn begin_shutdown(&self) {
        self.state.borrow_mut().shutting_down = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.borrow().shutting_down
    }

    pub fn job_count(&self) -> usize {
        self.state.borrow().live_jobs
    }

    pub fn is_job_alive(&self, id: JobId) -> bool {
        let mut state = self.state.borrow_mut();
        state
            .slot_mut(id)
            .is_some_and(|slot| !matches!(slot.state, SlotState::Vacant))
    }

    pub(crate) fn checkout_job(
        &self,
        id: JobId,
    ) -> Result<(Box<dyn Job>, JobBase), JobUnavailable> {
        let mut state = self.state.borrow_mut();
        let Some(slot) = state.slot_mut(id) else {
            return Err(JobUnavailable::Gone);
        };
        match std::mem::replace(&mut slot.state, SlotState::Busy) {
            SlotState::Idle(job, base) => Ok((job, base)),
            SlotState::Busy => Err(JobUnavailable::Busy),
            SlotState::Vacant => {
                slot.state = SlotState::Vacant;
                Err(JobUnavailable::Gone)
            }
        }
    }

    /// Exit half of the call wrapper: destroy the job if it is done, else
    /// put it back into its slot.
    pub(crate) fn finish_call(&self, mut job: Box<dyn Job>, mut base: JobBase) {
        {
            let mut ctx = JobContext::new(&mut base, self, "AsyncJob::callEnd");
            job.call_end(&mut ctx);
        }
        let done = base.stopping() || job.done_all();
        if !done {
            let id = base.id();
            let mut state = self.state.borrow_mut();
            if let Some(slot) = state.slot_mut(id) {
                slot.state = SlotState::Idle(job, base);
            }
            return;
        }

        match base.stop_reason() {
            Some(reason) => debug!("{} {} will stop, reason: {reason}", base.type_name(), base.id()),
            None => debug!("{} {} will stop, reason: done", base.type_name(), base.id()),
        }
        {
            let mut ctx = JobContext::new(&mut base, self, "AsyncJob::swanSong");
            job.swan_song(&mut ctx);
        }
        self.release_slot(base.id());
        debug!("{} {} destroyed", base.type_name(), base.id());
        drop(job);
    }

    fn release_slot(&self, id: JobId) {
        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.slot_mut(id) {
            slot.state = SlotState::Vacant;
            slot.generation = slot.generation.wrapping_add(1);
            state.free_slots.push(id.index());
            state.live_jobs -= 1;
        }
    }

    /// Pop the next call to make, moving due timers to the queue first.
    pub(crate) fn pop_ready_call(&self) -> Option<AsyncCall> {
        let mut state = self.state.borrow_mut();
        let now = state.clock.now();
        while let Some(entry) = state.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let call = entry.remove();
            state.queue.push_back(call);
        }
        state.queue.pop_front()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut state = self.state.borrow_mut();
        while let Some(entry) = state.timers.first_entry() {
            if entry.get().is_cancelled() {
                entry.remove();
                continue;
            }
            return Some(entry.key().0);
        }
        None
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub(crate) fn advance_clock(&self, by: Duration) -> bool {
        let mut state = self.state.borrow_mut();
        match &mut state.clock {
            Clock::Manual { offset, .. } => {
                *offset += by;
                true
            }
            Clock::System => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct WeakScheduler {
    state: Weak<RefCell<LoopState>>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.state.upgrade().map(|state| Scheduler { state })
    }

    /// Queue the call if the loop still exists.
    pub fn schedule(&self, call: AsyncCall) -> bool {
        match self.upgrade() {
            Some(sched) => {
                sched.schedule(call);
                true
            }
            None => {
                debug!("event loop is gone, dropping {call}");
                false
            }
        }
    }
}
