/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use g3_async_job::{Job, JobContext};

use super::IcapService;
use crate::icap::IcapServiceOptions;
use crate::{AdaptationAnswer, Initiator};

/// The job acting for a service: it receives OPTIONS answers and runs the
/// service timers.
pub(super) struct IcapServiceRep {
    service: IcapService,
}

impl IcapServiceRep {
    pub(super) fn new(service: IcapService) -> Self {
        IcapServiceRep { service }
    }

    pub(super) fn service(&self) -> &IcapService {
        &self.service
    }
}

impl Job for IcapServiceRep {
    fn type_name(&self) -> &'static str {
        "IcapServiceRep"
    }

    fn start(&mut self, _ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn done_all(&self) -> bool {
        let state = self.service.shared.state.borrow();
        state.detached && !state.fetching
    }

    fn swan_song(&mut self, _ctx: &mut JobContext<'_>) {
        let mut state = self.service.shared.state.borrow_mut();
        if let Some(t) = state.update_timer.take() {
            t.cancel("service gone");
        }
        let n = state.idle.len();
        IcapService::close_idle(&mut state, n);
        state.rep = None;
    }

    fn status(&self) -> String {
        self.service.status()
    }
}

impl Initiator for IcapServiceRep {
    fn note_adaptation_answer(
        &mut self,
        ctx: &mut JobContext<'_>,
        answer: AdaptationAnswer,
    ) -> anyhow::Result<()> {
        let options = match answer {
            AdaptationAnswer::Forward { message, .. } => {
                let o = IcapServiceOptions::parse(
                    &message.head,
                    ctx.now(),
                    self.service.config().default_options_ttl,
                );
                Some(o)
            }
            AdaptationAnswer::Block { .. } => None,
        };
        self.service.note_options_fetched(options);
        Ok(())
    }

    fn note_adaptation_query_abort(
        &mut self,
        _ctx: &mut JobContext<'_>,
        _is_final: bool,
    ) -> anyhow::Result<()> {
        self.service.note_options_fetched(None);
        Ok(())
    }
}
