/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use log::debug;

use g3_async_job::{Job, JobContext};

use super::IcapService;
use super::modxact::ModXact;
use crate::{
    AdaptationAnswer, AdaptationMessage, Initiate, InitiateCore, InitiateHandle, Initiator,
    XactAbortInfo,
};

/// A transaction that failed without losing anything gets one more try.
const MAX_LAUNCHES: u32 = 2;

/// Runs [`ModXact`] attempts for one adaptation and relays the outcome to
/// the initiator.
pub(crate) struct IcapLauncher {
    service: IcapService,
    virgin: AdaptationMessage,
    core: InitiateCore,
    xact: Option<InitiateHandle>,
    launches: u32,
}

impl IcapLauncher {
    pub(crate) fn new(service: IcapService, virgin: AdaptationMessage, core: InitiateCore) -> Self {
        IcapLauncher {
            service,
            virgin,
            core,
            xact: None,
            launches: 0,
        }
    }

    fn launch_xaction(&mut self, ctx: &mut JobContext<'_>, kind: &str) {
        self.launches += 1;
        debug!(
            "launching {kind} ICAP transaction #{} to service {}",
            self.launches,
            self.service.name()
        );
        let xact = ModXact::new(
            self.service.clone(),
            self.virgin.clone(),
            InitiateCore::for_initiator(&ctx.handle::<Self>()),
            self.launches == 1,
        );
        let handle = ctx.scheduler().start_job(xact);
        self.xact = Some(InitiateHandle::new(handle));
    }

    fn can_retry(&self, ctx: &JobContext<'_>, info: XactAbortInfo) -> bool {
        info.retriable && self.launches < MAX_LAUNCHES && !ctx.scheduler().is_shutting_down()
    }
}

impl Job for IcapLauncher {
    fn type_name(&self) -> &'static str {
        "IcapLauncher"
    }

    fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        self.launch_xaction(ctx, "first");
        Ok(())
    }

    fn done_all(&self) -> bool {
        self.xact.is_none() && !self.core.has_initiator()
    }

    fn swan_song(&mut self, _ctx: &mut JobContext<'_>) {
        InitiateHandle::announce_initiator_abort(&mut self.xact);
        self.core.swan_song();
    }

    fn status(&self) -> String {
        format!("[launches {}]", self.launches)
    }
}

impl Initiate for IcapLauncher {
    fn initiate_core(&mut self) -> &mut InitiateCore {
        &mut self.core
    }
}

impl Initiator for IcapLauncher {
    fn note_adaptation_answer(
        &mut self,
        _ctx: &mut JobContext<'_>,
        answer: AdaptationAnswer,
    ) -> anyhow::Result<()> {
        self.xact = None;
        self.core.send_answer(answer);
        Ok(())
    }

    fn note_adaptation_query_abort(
        &mut self,
        _ctx: &mut JobContext<'_>,
        is_final: bool,
    ) -> anyhow::Result<()> {
        self.xact = None;
        self.core.tell_query_aborted(is_final);
        Ok(())
    }

    fn note_xact_abort(
        &mut self,
        ctx: &mut JobContext<'_>,
        info: XactAbortInfo,
    ) -> anyhow::Result<()> {
        self.xact = None;
        if self.can_retry(ctx, info) {
            self.launch_xaction(ctx, "retry");
        } else {
            debug!("ICAP transaction to {} cannot be retried", self.service.name());
            self.core.tell_query_aborted(true);
        }
        Ok(())
    }
}
