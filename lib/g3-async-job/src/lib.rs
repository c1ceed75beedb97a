/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Single threaded cooperative jobs.
//!
//! A [`Job`] is owned by the event loop once started and is only reachable
//! through weak [`JobHandle`]s. Every call into a job is queued as an
//! [`AsyncCall`] and dispatched one at a time; a job is destroyed at the end
//! of the call that leaves it done.

mod call;
pub use call::{AsyncCall, AsyncCallback, CallCanceller};

mod job;
pub use job::{Job, JobContext, JobHandle, JobId};

mod scheduler;
pub use scheduler::{Scheduler, WeakScheduler};

mod event_loop;
pub use event_loop::EventLoop;
