/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! Content adaptation through ICAP services and in-process eCAP adapters.
//!
//! An initiator hands a virgin HTTP message to a service and later receives
//! an [`AdaptationAnswer`] or an abort notification. All of the work runs
//! as jobs on a single threaded [`g3_async_job::EventLoop`].

mod answer;
pub use answer::{AdaptationAnswer, AdaptationOutcome};

mod message;
pub use message::AdaptationMessage;

mod initiate;
pub use initiate::{Initiate, InitiateCore, InitiateHandle, Initiator, XactAbortInfo};

pub mod config;
pub mod ecap;
pub mod icap;

mod context;
pub use context::{AdaptationContext, AdaptationService};
