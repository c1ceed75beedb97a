/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::rc::Rc;

use anyhow::anyhow;
use log::debug;

use g3_async_job::{Job, JobContext};
use g3_body_pipe::{BodyConsumer, BodyPipe, BodyProducer};
use g3_http::HttpHead;

use super::{AdapterDecision, EcapService, LocalAdapterXaction};
use crate::{AdaptationAnswer, AdaptationMessage, AdaptationOutcome, Initiate, InitiateCore};

/// Progress of one body direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum BodyOp {
    Undecided,
    On,
    Complete,
    Never,
}

impl BodyOp {
    #[inline]
    fn finished(self) -> bool {
        self >= BodyOp::Complete
    }
}

/// Drives a [`LocalAdapterXaction`]: feeds it the virgin body and moves
/// what it produces into the adapted pipe.
pub(super) struct EcapXaction {
    service: EcapService,
    adapter: Option<Box<dyn LocalAdapterXaction>>,
    virgin: AdaptationMessage,
    virgin_pipe: Option<BodyPipe>,
    core: InitiateCore,
    making_vb: BodyOp,
    proxying_ab: BodyOp,
    adapted_pipe: Option<BodyPipe>,
    /// Adapted bytes that did not fit into the pipe yet.
    ab_buf: Vec<u8>,
    /// Set once the adapter produced everything, with the at-end flag.
    ab_finished: Option<bool>,
}

impl EcapXaction {
    pub(super) fn new(
        service: EcapService,
        adapter: Box<dyn LocalAdapterXaction>,
        mut virgin: AdaptationMessage,
        core: InitiateCore,
    ) -> Self {
        let virgin_pipe = virgin.body.take();
        EcapXaction {
            service,
            adapter: Some(adapter),
            virgin,
            virgin_pipe,
            core,
            making_vb: BodyOp::Undecided,
            proxying_ab: BodyOp::Undecided,
            adapted_pipe: None,
            ab_buf: Vec::new(),
            ab_finished: None,
        }
    }

    fn adapter(&mut self) -> anyhow::Result<&mut Box<dyn LocalAdapterXaction>> {
        self.adapter
            .as_mut()
            .ok_or_else(|| anyhow!("adapter transaction already stopped"))
    }

    /// Stop receiving the virgin body, leaving it untouched for others.
    fn preserve_vb(&mut self, reason: &str) {
        debug!("preserving virgin body for {reason}");
        self.forget_vb();
    }

    /// Stop receiving the virgin body, letting the pipe drain by itself.
    fn sink_vb(&mut self, reason: &str) {
        debug!("sinking virgin body for {reason}");
        if let Some(pipe) = &self.virgin_pipe {
            pipe.enable_auto_consumption();
        }
        self.forget_vb();
    }

    fn forget_vb(&mut self) {
        if let Some(pipe) = self.virgin_pipe.take() {
            pipe.clear_consumer();
        }
        self.making_vb = match self.making_vb {
            BodyOp::Undecided => BodyOp::Never,
            BodyOp::On => BodyOp::Complete,
            op => op,
        };
    }

    fn forward(&mut self, message: AdaptationMessage, outcome: AdaptationOutcome) {
        debug!(
            "sending {outcome} answer from eCAP service {}",
            self.service.name()
        );
        self.core
            .send_answer(AdaptationAnswer::Forward { message, outcome });
    }

    fn use_virgin(&mut self, outcome: AdaptationOutcome) -> anyhow::Result<()> {
        self.proxying_ab = BodyOp::Never;
        if self
            .virgin_pipe
            .as_ref()
            .is_some_and(|p| p.consumed_size() > 0)
        {
            return Err(anyhow!("virgin body was consumed already"));
        }
        let head = self.virgin.clone_head()?;
        // the answer shares the virgin pipe, which nobody consumed yet
        let body = self.virgin_pipe.clone();
        self.preserve_vb("use virgin");

        let mut message = AdaptationMessage::new(head, body);
        message.cause = self.virgin.cause.clone();
        message.client_addr = self.virgin.client_addr;
        message.client_username = self.virgin.client_username.clone();
        self.forward(message, outcome);
        Ok(())
    }

    fn use_adapted(
        &mut self,
        ctx: &mut JobContext<'_>,
        head: HttpHead,
        has_body: bool,
    ) -> anyhow::Result<()> {
        let mut message = AdaptationMessage::new(head, None);
        message.cause = if !message.head.is_request() && self.virgin.head.is_request() {
            Some(Rc::new(self.virgin.head.clone()))
        } else {
            self.virgin.cause.clone()
        };
        message.client_addr = self.virgin.client_addr;
        message.client_username = self.virgin.client_username.clone();

        if !has_body {
            self.proxying_ab = BodyOp::Never;
            self.sink_vb("bodyless adapted message");
            self.forward(message, AdaptationOutcome::Adapted);
            return Ok(());
        }

        self.proxying_ab = BodyOp::On;
        let pipe = BodyPipe::new(&ctx.handle::<Self>());
        message.body = Some(pipe.clone());
        self.adapted_pipe = Some(pipe);
        self.forward(message, AdaptationOutcome::Adapted);

        match &self.virgin_pipe {
            Some(pipe) => {
                if !pipe.set_consumer_if_not_late(&ctx.handle::<Self>()) {
                    return Err(anyhow!("virgin body is already being consumed"));
                }
                self.making_vb = BodyOp::On;
            }
            None => {
                self.making_vb = BodyOp::Never;
                let mut out = std::mem::take(&mut self.ab_buf);
                self.adapter()?.finish_body(true, &mut out)?;
                self.ab_buf = out;
                self.ab_finished = Some(true);
                self.move_ab_content();
            }
        }
        Ok(())
    }

    fn block_virgin(&mut self) {
        self.proxying_ab = BodyOp::Never;
        self.sink_vb("block");
        debug!("eCAP service {} blocks the message", self.service.name());
        self.core.send_answer(AdaptationAnswer::Block {
            service: self.service.shared.name.clone(),
        });
    }

    /// Pass buffered virgin bytes to the adapter while there is room for
    /// its output.
    fn feed_virgin(&mut self) -> anyhow::Result<()> {
        if self.making_vb != BodyOp::On {
            return Ok(());
        }
        let Some(pipe) = self.virgin_pipe.clone() else {
            return Ok(());
        };

        if self.ab_buf.len() < BodyPipe::MAX_CAPACITY {
            let mut data = Vec::new();
            pipe.get_more_data(&mut data);
            if !data.is_empty() {
                let mut out = std::mem::take(&mut self.ab_buf);
                self.adapter()?.adapt_body(&data, &mut out)?;
                self.ab_buf = out;
            }
        } else {
            debug!("waiting for the adapted body to drain");
        }

        if pipe.exhausted() || (pipe.production_ended() && !pipe.has_content()) {
            let at_end = !pipe.production_aborted();
            let mut out = std::mem::take(&mut self.ab_buf);
            self.adapter()?.finish_body(at_end, &mut out)?;
            self.ab_buf = out;
            self.ab_finished = Some(at_end);
            pipe.clear_consumer();
            self.virgin_pipe = None;
            self.making_vb = BodyOp::Complete;
        }
        self.move_ab_content();
        Ok(())
    }

    fn move_ab_content(&mut self) {
        if self.proxying_ab != BodyOp::On {
            return;
        }
        let Some(pipe) = self.adapted_pipe.clone() else {
            return;
        };
        if !self.ab_buf.is_empty() {
            let n = pipe.put_more_data(&self.ab_buf);
            self.ab_buf.drain(..n);
        }
        if self.ab_buf.is_empty() {
            if let Some(at_end) = self.ab_finished {
                debug!("last adapted body data moved {}", pipe.status());
                pipe.clear_producer(at_end);
                self.adapted_pipe = None;
                self.proxying_ab = BodyOp::Complete;
            }
        }
    }

    fn stop_adapter(&mut self) {
        if let Some(mut adapter) = self.adapter.take() {
            adapter.stop();
        }
    }
}

impl Job for EcapXaction {
    fn type_name(&self) -> &'static str {
        "EcapXaction"
    }

    fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let decision = {
            let cause = self.virgin.cause.clone();
            let head = &self.virgin.head;
            match self.adapter.as_mut() {
                Some(adapter) => adapter.start(head, cause.as_deref()),
                None => Err(anyhow!("no adapter transaction")),
            }
        };
        let decision = match decision {
            Ok(d) => d,
            Err(e) if self.service.bypass() => {
                debug!(
                    "bypassing eCAP service {} after: {e:#}",
                    self.service.name()
                );
                return self.use_virgin(AdaptationOutcome::Bypassed);
            }
            Err(e) => return Err(e),
        };
        debug!("eCAP service {} decided {decision:?}", self.service.name());

        match decision {
            AdapterDecision::UseVirgin => self.use_virgin(AdaptationOutcome::Unmodified),
            AdapterDecision::UseAdapted { head, has_body } => {
                self.use_adapted(ctx, head, has_body)
            }
            AdapterDecision::Block => {
                self.block_virgin();
                Ok(())
            }
        }
    }

    fn done_all(&self) -> bool {
        self.making_vb.finished() && self.proxying_ab.finished() && !self.core.has_initiator()
    }

    fn swan_song(&mut self, _ctx: &mut JobContext<'_>) {
        if let Some(pipe) = self.adapted_pipe.take() {
            pipe.clear_producer(false);
        }
        if let Some(pipe) = self.virgin_pipe.take() {
            pipe.clear_consumer();
        }
        self.stop_adapter();
        self.core.swan_song();
    }

    fn status(&self) -> String {
        let mut s = format!("[M{:?} A{:?}", self.making_vb, self.proxying_ab);
        if let Some(pipe) = &self.virgin_pipe {
            s.push_str(" v");
            s.push_str(&pipe.status());
        }
        if let Some(pipe) = &self.adapted_pipe {
            s.push_str(" a");
            s.push_str(&pipe.status());
        }
        if !self.ab_buf.is_empty() {
            s.push_str(&format!(" pending {}", self.ab_buf.len()));
        }
        s.push(']');
        s
    }
}

impl Initiate for EcapXaction {
    fn initiate_core(&mut self) -> &mut InitiateCore {
        &mut self.core
    }
}

impl BodyProducer for EcapXaction {
    fn note_more_body_space_available(
        &mut self,
        _ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.move_ab_content();
        self.feed_virgin()
    }

    fn note_body_consumer_aborted(
        &mut self,
        _ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        if let Some(pipe) = self.adapted_pipe.take() {
            pipe.clear_producer(false);
        }
        self.proxying_ab = BodyOp::Complete;
        self.ab_buf.clear();
        self.sink_vb("adapted body consumer aborted");
        self.stop_adapter();
        Ok(())
    }
}

impl BodyConsumer for EcapXaction {
    fn note_more_body_data_available(
        &mut self,
        _ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.feed_virgin()
    }

    fn note_body_production_ended(
        &mut self,
        _ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.feed_virgin()
    }

    fn note_body_producer_aborted(
        &mut self,
        _ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        debug!("virgin body producer aborted");
        self.feed_virgin()
    }
}
