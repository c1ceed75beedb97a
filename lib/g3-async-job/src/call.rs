/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::WeakScheduler;

type CancelFlag = Rc<Cell<Option<&'static str>>>;

fn cancel_flag(flag: &CancelFlag, reason: &'static str) {
    if flag.get().is_none() {
        flag.set(Some(reason));
    }
}

/// A named, cancellable unit of work queued on the event loop.
pub struct AsyncCall {
    name: &'static str,
    id: u64,
    cancelled: CancelFlag,
    dialer: Box<dyn FnOnce()>,
}

impl AsyncCall {
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        AsyncCall {
            name,
            id: 0,
            cancelled: Rc::new(Cell::new(None)),
            dialer: Box::new(f),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Prevent the call from being made. The first reason wins.
    pub fn cancel(&self, reason: &'static str) {
        cancel_flag(&self.cancelled, reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get().is_some()
    }

    pub fn canceller(&self) -> CallCanceller {
        CallCanceller {
            cancelled: self.cancelled.clone(),
        }
    }

    pub(crate) fn make(self) {
        if let Some(reason) = self.cancelled.get() {
            debug!(
                "will not call {} [call{}] because of {reason}",
                self.name, self.id
            );
            return;
        }
        (self.dialer)()
    }
}

impl fmt::Display for AsyncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [call{}]", self.name, self.id)
    }
}

/// Cancels a call that has already been handed over to the loop or to an
/// I/O layer.
#[derive(Clone)]
pub struct CallCanceller {
    cancelled: CancelFlag,
}

impl CallCanceller {
    pub fn cancel(&self, reason: &'static str) {
        cancel_flag(&self.cancelled, reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get().is_some()
    }
}

/// A call still waiting for its argument, such as an I/O completion.
pub struct AsyncCallback<A> {
    name: &'static str,
    sched: WeakScheduler,
    cancelled: CancelFlag,
    dialer: Box<dyn FnOnce(A)>,
}

impl<A: 'static> AsyncCallback<A> {
    pub fn new<F>(name: &'static str, sched: WeakScheduler, f: F) -> Self
    where
        F: FnOnce(A) + 'static,
    {
        AsyncCallback {
            name,
            sched,
            cancelled: Rc::new(Cell::new(None)),
            dialer: Box::new(f),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self, reason: &'static str) {
        cancel_flag(&self.cancelled, reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get().is_some()
    }

    pub fn canceller(&self) -> CallCanceller {
        CallCanceller {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Bind the argument. The resulting call shares the cancellation state.
    pub fn into_call(self, arg: A) -> AsyncCall {
        let AsyncCallback {
            name,
            cancelled,
            dialer,
            ..
        } = self;
        AsyncCall {
            name,
            id: 0,
            cancelled,
            dialer: Box::new(move || dialer(arg)),
        }
    }

    /// Bind the argument and queue the call. Returns false if the loop is gone.
    pub fn schedule(self, arg: A) -> bool {
        match self.sched.upgrade() {
            Some(sched) => {
                sched.schedule(self.into_call(arg));
                true
            }
            None => {
                debug!("event loop is gone, dropping {}", self.name);
                false
            }
        }
    }
}
