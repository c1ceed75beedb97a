/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! In-process adapters with the same adaptation semantics as ICAP services,
//! minus the network hop.

use std::fmt;
use std::rc::Rc;

use arcstr::ArcStr;

use g3_async_job::{JobHandle, Scheduler, WeakScheduler};
use g3_http::HttpHead;

use crate::{AdaptationMessage, InitiateCore, InitiateHandle, Initiator};

mod xaction;
use xaction::EcapXaction;

#[cfg(test)]
mod tests;

/// What an adapter wants done with a message, decided from its head.
pub enum AdapterDecision {
    /// Forward the virgin message as is.
    UseVirgin,
    /// Forward a new head. With `has_body` the adapter produces the body
    /// from the virgin one through [`LocalAdapterXaction::adapt_body`].
    UseAdapted { head: HttpHead, has_body: bool },
    /// Deny the message.
    Block,
}

impl fmt::Debug for AdapterDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterDecision::UseVirgin => f.write_str("UseVirgin"),
            AdapterDecision::UseAdapted { head, has_body } => f
                .debug_struct("UseAdapted")
                .field("head", head.start_line())
                .field("has_body", has_body)
                .finish(),
            AdapterDecision::Block => f.write_str("Block"),
        }
    }
}

/// One message adaptation done by an in-process adapter.
pub trait LocalAdapterXaction {
    fn start(
        &mut self,
        virgin: &HttpHead,
        cause: Option<&HttpHead>,
    ) -> anyhow::Result<AdapterDecision>;

    /// Adapt the next piece of virgin body, appending the result to `out`.
    fn adapt_body(&mut self, data: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()>;

    /// The virgin body ended, or was cut short if `at_end` is false.
    fn finish_body(&mut self, at_end: bool, out: &mut Vec<u8>) -> anyhow::Result<()>;

    /// The transaction is going away before the body was finished.
    fn stop(&mut self) {}
}

/// An adapter module able to start transactions.
pub trait LocalAdapterService {
    fn uri(&self) -> &str;

    fn make_xaction(&self) -> Box<dyn LocalAdapterXaction>;
}

struct EcapShared {
    name: ArcStr,
    adapter: Rc<dyn LocalAdapterService>,
    bypass: bool,
    sched: WeakScheduler,
}

/// A configured in-process adapter. Clones share the same adapter.
#[derive(Clone)]
pub struct EcapService {
    shared: Rc<EcapShared>,
}

impl fmt::Debug for EcapService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EcapService({} {})",
            self.shared.name,
            self.shared.adapter.uri()
        )
    }
}

impl EcapService {
    pub fn new(
        name: ArcStr,
        adapter: Rc<dyn LocalAdapterService>,
        bypass: bool,
        sched: &Scheduler,
    ) -> Self {
        EcapService {
            shared: Rc::new(EcapShared {
                name,
                adapter,
                bypass,
                sched: sched.downgrade(),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[inline]
    pub fn uri(&self) -> &str {
        self.shared.adapter.uri()
    }

    /// A failing adapter may be skipped.
    #[inline]
    pub fn bypass(&self) -> bool {
        self.shared.bypass
    }

    pub fn start_xaction<I: Initiator>(
        &self,
        initiator: &JobHandle<I>,
        virgin: AdaptationMessage,
    ) -> Option<InitiateHandle> {
        let sched = self.shared.sched.upgrade()?;
        let xact = EcapXaction::new(
            self.clone(),
            self.shared.adapter.make_xaction(),
            virgin,
            InitiateCore::for_initiator(initiator),
        );
        Some(InitiateHandle::new(sched.start_job(xact)))
    }
}
