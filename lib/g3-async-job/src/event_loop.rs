/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::time::{Duration, Instant};

use log::warn;

use crate::Scheduler;

pub struct EventLoop {
    sched: Scheduler,
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            sched: Scheduler::new(false),
        }
    }

    /// A loop whose clock only moves when [`EventLoop::advance`] is called.
    pub fn with_manual_clock() -> Self {
        EventLoop {
            sched: Scheduler::new(true),
        }
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn now(&self) -> Instant {
        self.sched.now()
    }

    /// Make at most one call. Returns false if nothing was ready.
    pub fn run_once(&self) -> bool {
        match self.sched.pop_ready_call() {
            Some(call) => {
                call.make();
                true
            }
            None => false,
        }
    }

    /// Make calls until none is ready, returning how many were popped.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.run_once() {
            count += 1;
        }
        count
    }

    pub fn advance(&self, by: Duration) {
        if !self.sched.advance_clock(by) {
            warn!("can not advance a loop driven by the system clock");
        }
    }

    /// Advance the manual clock and run everything that became ready.
    pub fn advance_and_run(&self, by: Duration) -> usize {
        self.advance(by);
        self.run_until_idle()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sched.next_deadline()
    }

    pub fn pending_calls(&self) -> usize {
        self.sched.pending_calls()
    }

    pub fn job_count(&self) -> usize {
        self.sched.job_count()
    }
}
