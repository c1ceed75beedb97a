/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use http::header;
use log::debug;

use g3_async_job::{Job, JobContext};
use g3_http::HttpHead;

use crate::config::IcapMethod;
use crate::icap::xaction::{IcapXaction, XactionCore};
use crate::icap::{IcapEncapsulated, IcapErrorReason, IcapService, IcapXactError};
use crate::{AdaptationAnswer, AdaptationMessage, AdaptationOutcome, Initiate, InitiateCore};

/// Fetches the OPTIONS of a service. The answer carries the ICAP response
/// head, to be parsed by the service itself.
pub(crate) struct OptXact {
    core: XactionCore,
    read_all: bool,
}

impl OptXact {
    pub(crate) fn new(service: IcapService, initiate: InitiateCore) -> Self {
        OptXact {
            core: XactionCore::new(service, initiate, false),
            read_all: false,
        }
    }

    fn make_request(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        self.core
            .service
            .config()
            .write_common_header(&mut buf, IcapMethod::Options);
        if !self.core.reuse_connection {
            buf.extend_from_slice(b"Connection: close\r\n");
        }
        buf.extend_from_slice(b"Allow: 204\r\n\r\n");
        buf
    }

    fn parse_response(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let max_size = self.core.service.config().icap_max_header_size;
        let head = match HttpHead::parse(&self.core.read_buf, self.core.comm_eof, max_size) {
            Ok(Some(head)) => head,
            Ok(None) => {
                self.schedule_read(ctx);
                return Ok(());
            }
            Err(e) => return Err(IcapXactError::InvalidIcapHead(e).into()),
        };
        self.read_all = true;

        if head.has_list_member(&header::CONNECTION, "close") {
            self.core.reuse_connection = false;
        }
        // an opt-body is never read, so the connection state is unknown
        if let Some(v) = head.header_str("encapsulated") {
            let encapsulated = IcapEncapsulated::parse(v)?;
            if encapsulated.has_body_data() {
                self.core.reuse_connection = false;
            }
        }
        if self.core.read_buf.len() > head.hdr_size() {
            self.core.reuse_connection = false;
        }

        debug!(
            "got OPTIONS response from ICAP service {}",
            self.core.service.name()
        );
        self.core.initiate.send_answer(AdaptationAnswer::Forward {
            message: AdaptationMessage::new(head, None),
            outcome: AdaptationOutcome::Unmodified,
        });
        Ok(())
    }
}

impl Job for OptXact {
    fn type_name(&self) -> &'static str {
        "OptXact"
    }

    fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        self.open_connection(ctx)
    }

    fn done_all(&self) -> bool {
        self.core.io_done_all()
    }

    fn call_exception(&mut self, ctx: &mut JobContext<'_>, e: anyhow::Error) {
        self.xaction_call_exception(ctx, e);
    }

    fn swan_song(&mut self, _ctx: &mut JobContext<'_>) {
        self.xaction_swan_song();
    }

    fn status(&self) -> String {
        let mut s = String::from("[");
        self.core.status_into(&mut s);
        if self.read_all {
            s.push_str(" done");
        }
        s.push(']');
        s
    }
}

impl Initiate for OptXact {
    fn initiate_core(&mut self) -> &mut InitiateCore {
        &mut self.core.initiate
    }
}

impl IcapXaction for OptXact {
    fn xaction(&mut self) -> &mut XactionCore {
        &mut self.core
    }

    fn xaction_ref(&self) -> &XactionCore {
        &self.core
    }

    fn handle_comm_connected(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let request = self.make_request();
        self.schedule_write(ctx, request);
        Ok(())
    }

    fn handle_comm_wrote(&mut self, ctx: &mut JobContext<'_>, _size: usize) -> anyhow::Result<()> {
        self.schedule_read(ctx);
        Ok(())
    }

    fn handle_comm_read(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        if self.core.comm_eof && self.core.read_buf.is_empty() {
            return Err(IcapXactError::from(IcapErrorReason::ConnectionClosed).into());
        }
        self.parse_response(ctx)
    }

    fn done_reading(&self) -> bool {
        self.read_all
    }
}
