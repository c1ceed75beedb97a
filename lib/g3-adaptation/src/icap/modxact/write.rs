/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io::Write;

use http::header;
use log::debug;

use g3_async_job::JobContext;
use g3_http::{ChunkedEncoder, HttpHead};

use super::{BACKUP_LIMIT, ModXact, ParsingState, SizedEstimate, WritingState};
use crate::config::IcapMethod;
use crate::icap::IcapBodyKind;
use crate::icap::encapsulated::EncapsulatedWriter;
use crate::icap::serialize;
use crate::icap::xaction::IcapXaction;

/// Pack an HTTP head for encapsulation, without its hop-by-hop fields.
fn polished_head(head: &HttpHead) -> Vec<u8> {
    let mut head = head.clone();
    head.remove_hop_by_hop_headers();
    let mut buf = Vec::with_capacity(head.packed_size());
    head.pack_into(&mut buf);
    buf
}

impl ModXact {
    pub(super) fn start_writing(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        self.state.writing = WritingState::Connecting;
        self.decide_on_preview();
        self.decide_on_retries();
        self.open_connection(ctx)
    }

    fn decide_on_preview(&mut self) {
        if !self.core.service.config().preview_enable {
            debug!("preview disabled by local config");
            return;
        }
        let path = self.virgin.request_path().unwrap_or_default();
        let Some(wanted) = self.core.service.wants_preview(&path) else {
            debug!("should not offer preview for {path}");
            return;
        };

        let size = match self.virgin_body {
            SizedEstimate::NoBody => 0,
            SizedEstimate::Unknown => {
                debug!("will not offer preview of a body with unknown size");
                return;
            }
            SizedEstimate::Known(n) => wanted
                .min(BACKUP_LIMIT)
                .min(usize::try_from(n).unwrap_or(usize::MAX)),
        };
        debug!("should offer {size}-byte preview (service wanted {wanted})");
        self.preview.enable(size);
    }

    /// A retry resends the whole virgin body, so it must stay buffered
    /// until the first response byte.
    fn decide_on_retries(&mut self) {
        if !self.core.is_retriable || self.preview.enabled() || self.can_backup_everything() {
            return;
        }
        debug!("will not retry as the virgin body cannot be kept");
        self.core.disable_retries();
    }

    pub(super) fn make_request_headers(&mut self) -> Vec<u8> {
        let service = self.core.service.clone();
        let config = service.config();
        let method = config.method();

        let mut buf = Vec::with_capacity(1024);
        config.write_common_header(&mut buf, method);
        serialize::add_date(&mut buf);
        if !self.core.reuse_connection {
            buf.extend_from_slice(b"Connection: close\r\n");
        }
        if let Some(v) = self.virgin.head.headers().get(header::PROXY_AUTHORIZATION) {
            buf.extend_from_slice(b"Proxy-Authorization: ");
            buf.extend_from_slice(v.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        let mut encapsulated = EncapsulatedWriter::default();
        let body_kind = match method {
            IcapMethod::Respmod => {
                if let Some(req) = self.virgin.cause.as_deref() {
                    encapsulated.add_head("req-hdr", &polished_head(req));
                }
                encapsulated.add_head("res-hdr", &polished_head(&self.virgin.head));
                IcapBodyKind::ResBody
            }
            IcapMethod::Reqmod | IcapMethod::Options => {
                encapsulated.add_head("req-hdr", &polished_head(&self.virgin.head));
                IcapBodyKind::ReqBody
            }
        };
        if self.virgin_body.expected() {
            encapsulated.set_body(body_kind);
        } else {
            encapsulated.set_body(IcapBodyKind::NullBody);
        }
        encapsulated.write_header(&mut buf);

        if self.preview.enabled() {
            let _ = write!(buf, "Preview: {}\r\n", self.preview.advertised());
            if !self.virgin_body.expected() {
                // nothing to send, the preview is complete already
                self.preview.wrote(0, true);
            }
        }
        self.make_allow_header(&mut buf);

        if config.send_client_ip {
            if let Some(ip) = self.virgin.client_addr {
                serialize::add_client_addr(&mut buf, ip);
            }
        }
        if config.send_client_username {
            if let Some(user) = &self.virgin.client_username {
                serialize::add_client_username(
                    &mut buf,
                    &config.client_username_header,
                    user,
                    config.client_username_encode,
                );
            }
        }

        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&encapsulated.into_heads());
        buf
    }

    fn make_allow_header(&mut self, buf: &mut Vec<u8>) {
        // 204 inside a preview needs no permission
        let allow_204_in = self.preview.enabled();
        let allow_204_out = self.core.service.allows_204() && self.can_backup_everything();
        // the virgin tail of a 206 answer is echoed from the backup
        let allow_206 = self.core.service.allows_206() && self.can_backup_everything();
        self.state.allowed_postview_204 = allow_204_out;
        self.state.allowed_206 = allow_206;
        if !allow_204_in && !allow_204_out && !allow_206 {
            return;
        }

        if self.virgin_body.expected() {
            debug!("will backup virgin body for a possible 204 or 206");
            self.body_sending.plan();
        }
        match (allow_204_out, allow_206) {
            (true, true) => buf.extend_from_slice(b"Allow: 204, 206\r\n"),
            (true, false) => buf.extend_from_slice(b"Allow: 204\r\n"),
            (false, true) => buf.extend_from_slice(b"Allow: 206\r\n"),
            (false, false) => {}
        }
    }

    pub(super) fn handle_headers_wrote(&mut self, ctx: &mut JobContext<'_>) {
        if self.preview.enabled() {
            if self.preview.done() {
                self.decide_writing_after_preview("zero-size");
            } else {
                self.state.writing = WritingState::Preview;
            }
        } else if self.virgin_body.expected() {
            self.state.writing = WritingState::Prime;
        } else {
            self.stop_writing(true);
            return;
        }
        self.write_more(ctx);
    }

    pub(super) fn write_more(&mut self, ctx: &mut JobContext<'_>) {
        if self.core.writing() {
            debug!("waiting for the pending write");
            return;
        }
        match self.state.writing {
            WritingState::Init
            | WritingState::Connecting
            | WritingState::Headers
            | WritingState::Paused
            | WritingState::ReallyDone => {}
            WritingState::AlmostDone => self.stop_writing(false),
            WritingState::Preview => self.write_preview_body(ctx),
            WritingState::Prime => self.write_prime_body(ctx),
        }
    }

    fn write_preview_body(&mut self, ctx: &mut JobContext<'_>) {
        let size = self.preview.debt();
        self.write_some_body(ctx, "preview body", size);
        if self.preview.done() {
            self.decide_writing_after_preview("body");
        }
    }

    fn write_prime_body(&mut self, ctx: &mut JobContext<'_>) {
        self.write_some_body(ctx, "prime virgin body", usize::MAX);
        if self.virgin_body_end_reached(&self.body_writing) {
            debug!("wrote entire virgin body");
            self.stop_writing(true);
        }
    }

    fn write_some_body(&mut self, ctx: &mut JobContext<'_>, label: &str, size: usize) {
        let mut buf = Vec::new();

        let chunk_size = self.virgin_content_size(&self.body_writing).min(size);
        if chunk_size > 0 {
            if let Some(pipe) = &self.virgin_pipe {
                let data = pipe.copy_content(self.body_writing.offset(), chunk_size);
                debug!("will write {}-byte chunk of {label}", data.len());
                ChunkedEncoder::write_chunk(&mut buf, &data);
                self.body_writing.progress(data.len());
                self.virgin_consume();
            }
        }

        let wrote_eof = self.virgin_body_end_reached(&self.body_writing);
        let mut last_chunk = wrote_eof;
        if self.state.writing == WritingState::Preview {
            self.preview.wrote(chunk_size, wrote_eof);
            last_chunk = last_chunk || self.preview.done();
        }
        if last_chunk {
            let ieof = self.state.writing == WritingState::Preview && self.preview.ieof();
            debug!("will write last chunk of {label}, ieof: {ieof}");
            ChunkedEncoder::write_last_chunk(&mut buf, ieof);
        }

        if !buf.is_empty() {
            self.schedule_write(ctx, buf);
        }
    }

    fn decide_writing_after_preview(&mut self, kind: &str) {
        if self.preview.ieof() {
            debug!("{kind} preview covered the whole body");
            self.stop_writing(true);
        } else if self.state.parsing == ParsingState::IcapHeader {
            debug!("will wait for the ICAP server after {kind} preview");
            self.state.writing = WritingState::Paused;
        } else {
            // the server answered already, there is nothing to continue
            self.stop_writing(true);
        }
    }

    pub(super) fn stop_writing(&mut self, nicely: bool) {
        if self.state.writing == WritingState::ReallyDone {
            return;
        }
        if self.core.writing() {
            if nicely {
                debug!("will wait for the last write");
                self.state.writing = WritingState::AlmostDone;
                self.check_consuming();
                return;
            }
            self.core.cancel_write();
        }
        if self.body_writing.active() {
            self.body_writing.disable();
            self.virgin_consume();
        }
        self.state.writing = WritingState::ReallyDone;
        self.check_consuming();
    }
}
