/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use bytes::Buf;
use http::header;
use log::debug;

use g3_async_job::{Job, JobContext};
use g3_body_pipe::{BodyPipe, BodyPipeCheckout};
use g3_http::{ChunkedDecodeStatus, ChunkedDecoder, ChunkedSink, HttpHead};

use super::{ModXact, ParsingState, SendingState, WritingState};
use crate::AdaptationOutcome;
use crate::config::IcapMethod;
use crate::icap::xaction::IcapXaction;
use crate::icap::{IcapEncapsulated, IcapErrorReason, IcapXactError};

const CHUNK_LINE_MAX_SIZE: usize = 4096;

/// Decodes the adapted body straight into the pipe buffer.
struct CheckoutSink(BodyPipeCheckout);

impl ChunkedSink for CheckoutSink {
    fn space_size(&self) -> usize {
        self.0.space_size()
    }

    fn append(&mut self, data: &[u8]) -> usize {
        self.0.append(data)
    }
}

impl ModXact {
    pub(super) fn read_more(&mut self, ctx: &mut JobContext<'_>) {
        if self.core.reading() || self.done_reading() {
            return;
        }
        if self
            .adapted_pipe
            .as_ref()
            .is_some_and(|p| p.space_size() == 0)
        {
            debug!("waiting for space in the adapted body pipe");
            return;
        }
        if self.may_read_more() {
            self.schedule_read(ctx);
        } else {
            debug!("will not read more with a full read buffer");
        }
    }

    pub(super) fn parse_more(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        if self.state.parsing_headers() {
            self.parse_headers(ctx)?;
        }
        if self.state.parsing == ParsingState::Body {
            self.parse_body(ctx)?;
        }
        Ok(())
    }

    fn parse_headers(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        while self.state.parsing == ParsingState::IcapHeader {
            let left = self.core.read_buf.len();
            self.parse_icap_head(ctx)?;
            // the final response may follow 100 Continue in the same read
            if self.core.read_buf.is_empty() || self.core.read_buf.len() == left {
                break;
            }
        }
        if self.state.parsing == ParsingState::HttpHeader {
            self.parse_http_head(ctx)?;
        }
        if self.state.parsing_headers() {
            if self.core.comm_eof {
                return Err(IcapXactError::from(IcapErrorReason::ConnectionClosed).into());
            }
            return Ok(());
        }
        self.start_sending()
    }

    fn parse_head(&mut self, icap: bool) -> Result<Option<HttpHead>, IcapXactError> {
        let max_size = self.core.service.config().icap_max_header_size;
        match HttpHead::parse(&self.core.read_buf, self.core.comm_eof, max_size) {
            Ok(Some(head)) => {
                self.core.read_buf.advance(head.hdr_size());
                Ok(Some(head))
            }
            Ok(None) => Ok(None),
            Err(e) if icap => Err(IcapXactError::InvalidIcapHead(e)),
            Err(e) => Err(IcapXactError::InvalidHttpHead(e)),
        }
    }

    fn parse_icap_head(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        if self.core.read_buf.is_empty() {
            return Ok(());
        }
        let Some(head) = self.parse_head(true)? else {
            return Ok(());
        };
        let Some(code) = head.status_code().filter(|_| head.protocol().is_icap()) else {
            return Err(IcapXactError::from(IcapErrorReason::NotIcapResponse).into());
        };
        debug!(
            "got ICAP {code} response from service {}",
            self.core.service.name()
        );
        if head.has_list_member(&header::CONNECTION, "close") {
            self.core.reuse_connection = false;
        }

        match code {
            100 => self.handle_100_continue(ctx)?,
            200 | 201 => self.handle_200_ok(&head, false)?,
            204 => self.handle_204(ctx)?,
            206 if self.state.allowed_206 => self.handle_200_ok(&head, true)?,
            206 => {
                self.stop_parsing();
                self.stop_backup();
                return Err(IcapXactError::from(IcapErrorReason::Unexpected206).into());
            }
            _ => {
                self.stop_parsing();
                self.stop_backup();
                return Err(IcapXactError::from(IcapErrorReason::UnknownResponse).into());
            }
        }

        // an answer that is not 100 Continue ends a paused preview
        if self.state.writing == WritingState::Paused {
            self.stop_writing(true);
        }
        Ok(())
    }

    fn handle_100_continue(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        if self.state.writing != WritingState::Paused
            || !self.preview.enabled()
            || !self.preview.done()
        {
            return Err(IcapXactError::from(IcapErrorReason::UnexpectedContinue).into());
        }
        if self.preview.ieof() {
            return Err(IcapXactError::from(IcapErrorReason::ContinueAfterPreviewEof).into());
        }

        if !self.state.allowed_postview_204 && !self.state.allowed_206 {
            self.stop_backup();
        }
        self.state.parsing = ParsingState::IcapHeader;
        self.state.writing = WritingState::Prime;
        self.write_more(ctx);
        Ok(())
    }

    /// A 206 answer is handled as a 200 one whose body may end with the
    /// virgin body tail, so the backup is kept.
    fn handle_200_ok(&mut self, head: &HttpHead, partial: bool) -> anyhow::Result<()> {
        let value = head
            .header_str("encapsulated")
            .ok_or(IcapErrorReason::NoHttpHeadFound)
            .map_err(IcapXactError::from)?;
        let encapsulated = IcapEncapsulated::parse(value).map_err(IcapXactError::from)?;
        let valid = match self.core.service.config().method() {
            IcapMethod::Respmod => encapsulated.res_hdr().is_some(),
            IcapMethod::Reqmod | IcapMethod::Options => encapsulated.has_http_head(),
        };
        if !valid {
            return Err(IcapXactError::from(IcapErrorReason::NoHttpHeadFound).into());
        }
        self.http_head_skip = encapsulated.skip_before_res_hdr();
        self.encapsulated = Some(encapsulated);

        self.state.parsing = ParsingState::HttpHeader;
        self.state.sending = SendingState::Adapted;
        self.outcome = AdaptationOutcome::Adapted;
        if partial {
            self.state.partial_content = true;
        } else {
            self.stop_backup();
        }
        self.check_consuming();
        Ok(())
    }

    fn handle_204(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        self.stop_parsing();
        self.prep_echoing(ctx)
    }

    fn parse_http_head(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        if self.http_head_skip > 0 {
            // a request head sent back along with the response is not used
            let n = self.http_head_skip.min(self.core.read_buf.len());
            self.core.read_buf.advance(n);
            self.http_head_skip -= n;
            if self.http_head_skip > 0 {
                return Ok(());
            }
        }

        let Some(head) = self.parse_head(false)? else {
            return Ok(());
        };
        debug!("parsed adapted HTTP head: {:?}", head.start_line());
        self.adapted_head = Some(head);
        self.decide_on_parsing_body(ctx);
        Ok(())
    }

    fn decide_on_parsing_body(&mut self, ctx: &mut JobContext<'_>) {
        let has_body = self
            .encapsulated
            .as_ref()
            .and_then(|e| e.body_kind())
            .is_some_and(|k| k.has_data());
        if has_body {
            debug!("expecting adapted body");
            self.state.parsing = ParsingState::Body;
            self.body_parser = Some(ChunkedDecoder::new(CHUNK_LINE_MAX_SIZE));
            self.adapted_pipe = Some(BodyPipe::new(&ctx.handle::<Self>()));
        } else {
            debug!("not expecting adapted body");
            self.stop_parsing();
            self.stop_backup();
            self.stop_sending(true);
        }
    }

    fn parse_body(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let Some(pipe) = self.adapted_pipe.clone() else {
            return Ok(());
        };
        let Some(parser) = self.body_parser.as_mut() else {
            return Ok(());
        };

        let mut sink = CheckoutSink(pipe.checkout());
        let r = parser.parse(&mut self.core.read_buf, &mut sink);
        sink.0.check_in();
        let status = r.map_err(IcapXactError::from)?;
        debug!("parsed adapted body {}", pipe.status());

        if pipe.produced_size() > 0 {
            self.disable_bypass("sent adapted content");
        }
        match status {
            ChunkedDecodeStatus::ParsedAll => {
                if !self.core.read_buf.is_empty() {
                    debug!("found garbage after the adapted body");
                    self.core.reuse_connection = false;
                }
                let original = self.body_parser.as_ref().and_then(|p| p.use_original_body());
                self.stop_parsing();
                match original {
                    Some(offset) if self.state.partial_content => self.echo_virgin_tail(offset)?,
                    _ => {
                        self.stop_backup();
                        self.stop_sending(true);
                    }
                }
            }
            ChunkedDecodeStatus::NeedMoreData => {
                if self.core.comm_eof {
                    return Err(IcapXactError::from(IcapErrorReason::TruncatedBody).into());
                }
                self.read_more(ctx);
            }
            ChunkedDecodeStatus::NeedMoreSpace => {
                debug!("waiting for the adapted body to be consumed");
            }
        }
        Ok(())
    }

    pub(super) fn stop_parsing(&mut self) {
        if self.state.done_parsing() {
            return;
        }
        debug!("will stop parsing {}", self.status());
        self.body_parser = None;
        self.state.parsing = ParsingState::Done;
    }
}
