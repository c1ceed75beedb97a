/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::rc::Rc;

use anyhow::anyhow;
use log::debug;

use g3_async_job::{CallCanceller, Job, JobContext};
use g3_body_pipe::{BodyConsumer, BodyPipe, BodyProducer};
use g3_http::{ChunkedDecoder, HttpBodySize, HttpHead};

use super::xaction::{IcapXaction, XactionCore};
use super::{IcapEncapsulated, IcapErrorReason, IcapService, IcapXactError};
use crate::{AdaptationAnswer, AdaptationMessage, AdaptationOutcome, Initiate, InitiateCore};

mod state;
use state::{
    ModXactState, ParsingState, Preview, SendingState, SizedEstimate, VirginBodyAct,
    WritingState,
};

mod parse;
mod write;

#[cfg(test)]
mod tests;

/// The most virgin body bytes kept around for a 204 or a bypass.
const BACKUP_LIMIT: usize = BodyPipe::MAX_CAPACITY;

/// One REQMOD or RESPMOD exchange with an ICAP service.
///
/// Writing the request, parsing the response and sending the adapted body
/// progress independently. Writing and echoing read the virgin body through
/// their own claims, and virgin bytes are consumed only once every active
/// claim has moved past them.
pub(crate) struct ModXact {
    core: XactionCore,
    virgin: AdaptationMessage,
    virgin_pipe: Option<BodyPipe>,
    virgin_body: SizedEstimate,
    body_writing: VirginBodyAct,
    body_sending: VirginBodyAct,
    can_start_bypass: bool,
    preview: Preview,
    state: ModXactState,
    slot_waiter: Option<CallCanceller>,
    encapsulated: Option<IcapEncapsulated>,
    http_head_skip: usize,
    adapted_head: Option<HttpHead>,
    adapted_pipe: Option<BodyPipe>,
    body_parser: Option<ChunkedDecoder>,
    outcome: AdaptationOutcome,
}

impl ModXact {
    pub(crate) fn new(
        service: IcapService,
        mut virgin: AdaptationMessage,
        initiate: InitiateCore,
        is_retriable: bool,
    ) -> Self {
        let virgin_pipe = virgin.body.take();
        ModXact {
            core: XactionCore::new(service, initiate, is_retriable),
            virgin,
            virgin_pipe,
            virgin_body: SizedEstimate::NoBody,
            body_writing: VirginBodyAct::default(),
            body_sending: VirginBodyAct::default(),
            can_start_bypass: false,
            preview: Preview::default(),
            state: ModXactState::default(),
            slot_waiter: None,
            encapsulated: None,
            http_head_skip: 0,
            adapted_head: None,
            adapted_pipe: None,
            body_parser: None,
            outcome: AdaptationOutcome::Adapted,
        }
    }

    fn estimate_virgin_body(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let Some(pipe) = &self.virgin_pipe else {
            self.virgin_body = SizedEstimate::NoBody;
            return Ok(());
        };

        let method = self.virgin.request_method().cloned();
        let size = match self.virgin.head.expecting_body(method.as_ref()) {
            Some(HttpBodySize::Known(n)) => Some(n),
            _ => pipe.body_size(),
        };
        if size == Some(0) {
            debug!("virgin message has an empty body");
            self.virgin_pipe = None;
            self.virgin_body = SizedEstimate::NoBody;
            return Ok(());
        }

        self.virgin_body = match size {
            Some(n) => SizedEstimate::Known(n),
            None => SizedEstimate::Unknown,
        };
        self.body_writing.plan();
        if !pipe.set_consumer_if_not_late(&ctx.handle::<Self>()) {
            return Err(anyhow!("virgin body is already being consumed"));
        }
        debug!("will write virgin body {}", pipe.status());
        Ok(())
    }

    fn wait_for_service(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let service = self.core.service.clone();
        let handle = ctx.handle::<Self>();
        if !service.up() {
            if service.broken() {
                self.core.disable_retries();
                return Err(IcapXactError::from(IcapErrorReason::ServiceUnusable).into());
            }
            debug!("will wait for ICAP service {} to be ready", service.name());
            let call = handle.async_call("ModXact::noteServiceReady", |x: &mut Self, ctx| {
                x.note_service_ready(ctx)
            });
            service.call_when_ready(call);
        } else {
            debug!("will wait for a free slot of ICAP service {}", service.name());
            let call = handle.async_call("ModXact::noteServiceAvailable", |x: &mut Self, ctx| {
                x.note_service_available(ctx)
            });
            self.slot_waiter = Some(call.canceller());
            service.call_when_available(call, self.state.waited_for_service);
        }
        self.state.service_waiting = true;
        self.state.waited_for_service = true;
        Ok(())
    }

    fn note_service_ready(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        self.state.service_waiting = false;
        if !self.core.service.up() {
            self.core.disable_retries();
            return Err(IcapXactError::from(IcapErrorReason::ServiceUnusable).into());
        }
        if self.core.service.available_for_old() {
            self.start_writing(ctx)
        } else {
            self.wait_for_service(ctx)
        }
    }

    fn note_service_available(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        self.state.service_waiting = false;
        self.slot_waiter = None;
        let r = if self.core.service.up() && self.core.service.available_for_old() {
            self.start_writing(ctx)
        } else {
            self.wait_for_service(ctx)
        };
        // the freed slot is taken or the wait is registered anew
        self.core.service.note_gone_waiter();
        r
    }

    fn can_backup_everything(&self) -> bool {
        match self.virgin_body {
            SizedEstimate::NoBody => true,
            SizedEstimate::Unknown => false,
            SizedEstimate::Known(size) => size < BACKUP_LIMIT as u64,
        }
    }

    fn disable_bypass(&mut self, reason: &str) {
        if self.can_start_bypass {
            debug!("will never start bypass because {reason}");
            self.can_start_bypass = false;
        }
    }

    /// Virgin bytes available to the claim.
    fn virgin_content_size(&self, act: &VirginBodyAct) -> usize {
        let Some(pipe) = &self.virgin_pipe else {
            return 0;
        };
        if !act.active() {
            return 0;
        }
        let end = pipe.consumed_size() + pipe.buffered_size() as u64;
        usize::try_from(end.saturating_sub(act.offset())).unwrap_or(usize::MAX)
    }

    fn virgin_body_end_reached(&self, act: &VirginBodyAct) -> bool {
        match &self.virgin_pipe {
            Some(pipe) => !act.active() || !pipe.expect_more_after(act.offset()),
            None => true,
        }
    }

    /// Drop the virgin bytes no active claim needs any more.
    ///
    /// Consumption is postponed while a retry or a bypass may still need the
    /// whole body, but only as long as the producer has room left.
    fn virgin_consume(&mut self) {
        let Some(pipe) = &self.virgin_pipe else {
            return;
        };
        let want_to_postpone = self.core.is_retriable || self.can_start_bypass;
        if want_to_postpone && pipe.space_size() > 0 {
            debug!("postponing virgin consumption from {}", pipe.status());
            return;
        }

        let consumed = pipe.consumed_size();
        let mut offset = consumed + pipe.buffered_size() as u64;
        if self.body_writing.active() {
            offset = offset.min(self.body_writing.offset());
        }
        if self.body_sending.active() {
            offset = offset.min(self.body_sending.offset());
        }
        let size = usize::try_from(offset - consumed).unwrap_or(usize::MAX);
        if size > 0 {
            pipe.consume(size);
            self.core.disable_retries();
            self.disable_bypass("consumed virgin content");
        }
    }

    fn check_consuming(&mut self) {
        if self.virgin_pipe.is_none() || !self.state.done_consuming_virgin() {
            return;
        }
        if let Some(pipe) = self.virgin_pipe.take() {
            debug!("will stop consuming {}", pipe.status());
            pipe.clear_consumer();
        }
    }

    /// Nobody will need the backed up bytes for a 204.
    fn stop_backup(&mut self) {
        if !self.body_sending.active() {
            return;
        }
        debug!("will no longer backup virgin body");
        self.body_sending.disable();
        self.virgin_consume();
    }

    /// Set up the virgin message as the answer.
    fn prep_echoing(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        self.disable_bypass("preparing to echo content");
        self.outcome = AdaptationOutcome::Unmodified;
        let head = self
            .virgin
            .clone_head()
            .map_err(IcapXactError::InvalidHttpHead)?;
        self.adapted_head = Some(head);

        let Some(pipe) = self.virgin_pipe.clone() else {
            debug!("will not echo virgin body as there is none");
            self.stop_sending(true);
            return Ok(());
        };
        if !self.body_sending.active() && (pipe.consumed_size() > 0 || !self.body_sending.plan())
        {
            return Err(IcapXactError::from(IcapErrorReason::Unexpected204).into());
        }
        self.state.sending = SendingState::Virgin;
        self.check_consuming();

        if let Some(old) = self.adapted_pipe.take() {
            old.clear_producer(false);
        }
        let adapted = BodyPipe::new(&ctx.handle::<Self>());
        if let Some(size) = self.virgin_body.known_size() {
            adapted.set_body_size(size);
        }
        debug!("will echo virgin body to {}", adapted.status());
        self.adapted_pipe = Some(adapted);
        Ok(())
    }

    fn start_sending(&mut self) -> anyhow::Result<()> {
        self.disable_bypass("sent headers");
        let Some(head) = self.adapted_head.take() else {
            return Err(anyhow!("no adapted head to send"));
        };

        let cause = if !head.is_request() && self.virgin.head.is_request() {
            Some(Rc::new(self.virgin.head.clone()))
        } else {
            self.virgin.cause.clone()
        };
        let mut message = AdaptationMessage::new(head, self.adapted_pipe.clone());
        message.cause = cause;
        message.client_addr = self.virgin.client_addr;
        message.client_username = self.virgin.client_username.clone();
        debug!(
            "sending {} answer from ICAP service {}",
            self.outcome,
            self.core.service.name()
        );
        self.core.initiate.send_answer(AdaptationAnswer::Forward {
            message,
            outcome: self.outcome,
        });

        if self.state.sending == SendingState::Virgin {
            self.echo_more();
        }
        Ok(())
    }

    fn echo_more(&mut self) {
        let (Some(virgin), Some(adapted)) = (self.virgin_pipe.clone(), self.adapted_pipe.clone())
        else {
            return;
        };
        let size = self
            .virgin_content_size(&self.body_sending)
            .min(adapted.space_size());
        if size > 0 && !adapted.production_ended() {
            let data = virgin.copy_content(self.body_sending.offset(), size);
            let n = adapted.put_more_data(&data);
            self.body_sending.progress(n);
            self.disable_bypass("echoed content");
            self.virgin_consume();
        }
        if self.virgin_body_end_reached(&self.body_sending) {
            debug!("echoed all virgin body");
            self.stop_sending(true);
        }
    }

    /// Follow the adapted part of a 206 answer with the virgin body from
    /// `offset` on.
    fn echo_virgin_tail(&mut self, offset: u64) -> anyhow::Result<()> {
        if self.virgin_pipe.is_none() {
            debug!("no virgin body to use after the adapted part");
            self.stop_sending(true);
            return Ok(());
        }
        if !self.body_sending.active() {
            return Err(IcapXactError::from(IcapErrorReason::Unexpected206).into());
        }
        let skip = usize::try_from(offset.saturating_sub(self.body_sending.offset()))
            .map_err(|_| anyhow!("original body offset {offset} is out of range"))?;
        debug!("will use virgin body from offset {offset}");
        self.body_sending.progress(skip);
        self.state.sending = SendingState::Virgin;
        self.virgin_consume();
        self.echo_more();
        Ok(())
    }

    fn stop_sending(&mut self, nicely: bool) {
        if self.state.done_sending() {
            return;
        }
        self.body_sending.disable();
        if let Some(pipe) = self.adapted_pipe.take() {
            let left_debts = pipe.unproduced_size().is_some_and(|n| n > 0);
            debug!("will stop producing {}, nicely: {nicely}", pipe.status());
            pipe.clear_producer(nicely && !left_debts);
        }
        self.state.sending = SendingState::Done;
        self.check_consuming();
    }

    /// Answer with the virgin message after a failure.
    fn bypass_failure(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        self.disable_bypass("already started to bypass");
        self.prep_echoing(ctx)?;
        self.outcome = AdaptationOutcome::Bypassed;
        self.start_sending()?;

        self.stop_parsing();
        self.stop_writing(true);
        if self.core.have_connection() {
            self.core.reuse_connection = false;
            self.core.cancel_read();
        }
        self.core.service.note_failure();
        Ok(())
    }

    fn adapted_space_available(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        match self.state.sending {
            SendingState::Virgin => {
                self.echo_more();
                Ok(())
            }
            SendingState::Adapted => self.parse_more(ctx),
            SendingState::Undecided | SendingState::Done => Ok(()),
        }
    }

    fn virgin_data_changed(&mut self, ctx: &mut JobContext<'_>) {
        self.write_more(ctx);
        if self.state.sending == SendingState::Virgin {
            self.echo_more();
        }
    }
}

impl Job for ModXact {
    fn type_name(&self) -> &'static str {
        "ModXact"
    }

    fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        self.estimate_virgin_body(ctx)?;
        self.can_start_bypass = self.core.service.config().bypass();
        let service = &self.core.service;
        if service.up() && service.available_for_new() {
            self.start_writing(ctx)
        } else {
            self.wait_for_service(ctx)
        }
    }

    fn done_all(&self) -> bool {
        self.core.io_done_all()
            && !self.state.service_waiting
            && self.state.done_sending()
            && self.done_reading()
            && self.state.done_writing()
    }

    fn call_exception(&mut self, ctx: &mut JobContext<'_>, e: anyhow::Error) {
        if !self.can_start_bypass || self.core.is_retriable {
            self.xaction_call_exception(ctx, e);
            return;
        }
        debug!(
            "bypassing ICAP service {} after: {e:#}",
            self.core.service.name()
        );
        if let Err(e) = self.bypass_failure(ctx) {
            self.xaction_call_exception(ctx, e);
        }
    }

    fn swan_song(&mut self, _ctx: &mut JobContext<'_>) {
        if let Some(waiter) = self.slot_waiter.take() {
            waiter.cancel("swan song");
            self.core.service.note_gone_waiter();
        }
        self.stop_writing(false);
        self.stop_sending(false);
        if let Some(pipe) = self.virgin_pipe.take() {
            pipe.clear_consumer();
        }
        self.xaction_swan_song();
    }

    fn status(&self) -> String {
        let mut s = String::from("[");
        self.state.status_into(&mut s);
        s.push(' ');
        self.core.status_into(&mut s);
        if let Some(pipe) = &self.virgin_pipe {
            s.push_str(" v");
            s.push_str(&pipe.status());
        }
        if let Some(pipe) = &self.adapted_pipe {
            s.push_str(" a");
            s.push_str(&pipe.status());
        }
        if self.can_start_bypass {
            s.push_str(" Ab");
        }
        s.push(']');
        s
    }
}

impl Initiate for ModXact {
    fn initiate_core(&mut self) -> &mut InitiateCore {
        &mut self.core.initiate
    }
}

impl IcapXaction for ModXact {
    fn xaction(&mut self) -> &mut XactionCore {
        &mut self.core
    }

    fn xaction_ref(&self) -> &XactionCore {
        &self.core
    }

    fn handle_comm_connected(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        // catch early errors and 204 responses
        self.read_more(ctx);
        let request = self.make_request_headers();
        self.state.writing = WritingState::Headers;
        self.schedule_write(ctx, request);
        Ok(())
    }

    fn handle_comm_wrote(&mut self, ctx: &mut JobContext<'_>, _size: usize) -> anyhow::Result<()> {
        if self.state.writing == WritingState::Headers {
            self.handle_headers_wrote(ctx);
        } else {
            self.write_more(ctx);
        }
        Ok(())
    }

    fn handle_comm_read(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        if self.state.done_parsing() {
            if !self.core.read_buf.is_empty() {
                debug!("ignoring unexpected data after the ICAP response");
                self.core.read_buf.clear();
                self.core.reuse_connection = false;
            }
            return Ok(());
        }
        self.parse_more(ctx)?;
        self.read_more(ctx);
        Ok(())
    }

    fn done_reading(&self) -> bool {
        self.core.comm_eof || self.state.done_parsing()
    }
}

impl BodyProducer for ModXact {
    fn note_more_body_space_available(
        &mut self,
        ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.adapted_space_available(ctx)
    }

    fn note_body_consumer_aborted(
        &mut self,
        ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.stop_sending(false);
        ctx.must_stop("adapted body consumer aborted");
        Ok(())
    }
}

impl BodyConsumer for ModXact {
    fn note_more_body_data_available(
        &mut self,
        ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.virgin_data_changed(ctx);
        Ok(())
    }

    fn note_body_production_ended(
        &mut self,
        ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.virgin_data_changed(ctx);
        Ok(())
    }

    fn note_body_producer_aborted(
        &mut self,
        ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        debug!("virgin body producer aborted");
        self.virgin_data_changed(ctx);
        Ok(())
    }
}
