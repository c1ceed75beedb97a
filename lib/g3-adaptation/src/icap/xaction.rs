/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;

use bytes::{Bytes, BytesMut};
use log::debug;

use g3_async_job::{CallCanceller, JobContext};

use super::transport::IcapConnection;
use super::{IcapService, IcapTransportError, IcapXactError};
use crate::{Initiate, InitiateCore, XactAbortInfo};

const READ_SIZE: usize = 16 * 1024;
const READ_BUF_LIMIT: usize = 64 * 1024;

/// Connection and I/O state shared by every ICAP transaction.
pub(crate) struct XactionCore {
    pub(crate) initiate: InitiateCore,
    pub(crate) service: IcapService,
    conn: Option<Box<dyn IcapConnection>>,
    connecting: Option<CallCanceller>,
    reader: Option<CallCanceller>,
    writer: Option<CallCanceller>,
    timeout: Option<CallCanceller>,
    pub(crate) read_buf: BytesMut,
    pub(crate) comm_eof: bool,
    pub(crate) reuse_connection: bool,
    /// No byte was received and the request may be sent again.
    pub(crate) is_retriable: bool,
    bytes_read: u64,
    failed: bool,
}

impl XactionCore {
    pub(crate) fn new(service: IcapService, initiate: InitiateCore, is_retriable: bool) -> Self {
        let reuse_connection = service.config().reuse_connections;
        XactionCore {
            initiate,
            service,
            conn: None,
            connecting: None,
            reader: None,
            writer: None,
            timeout: None,
            read_buf: BytesMut::new(),
            comm_eof: false,
            reuse_connection,
            is_retriable,
            bytes_read: 0,
            failed: false,
        }
    }

    pub(crate) fn disable_retries(&mut self) {
        if self.is_retriable {
            debug!("ICAP transaction is no longer retriable");
            self.is_retriable = false;
        }
    }

    #[inline]
    pub(crate) fn have_connection(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_open())
    }

    #[inline]
    pub(crate) fn reading(&self) -> bool {
        self.reader.is_some()
    }

    #[inline]
    pub(crate) fn writing(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn cancel_read(&mut self) {
        if let Some(r) = self.reader.take() {
            r.cancel("reading no more");
        }
    }

    /// Give up on a pending write. The connection is left in an unknown
    /// state and cannot be reused.
    pub(crate) fn cancel_write(&mut self) {
        if let Some(w) = self.writer.take() {
            w.cancel("writing no more");
            self.reuse_connection = false;
        }
    }

    fn cancel_timeout(&mut self) {
        if let Some(t) = self.timeout.take() {
            t.cancel("timeout reset");
        }
    }

    /// The transaction has nothing left to do with its peer or initiator.
    pub(crate) fn io_done_all(&self) -> bool {
        self.connecting.is_none()
            && self.reader.is_none()
            && self.writer.is_none()
            && !self.initiate.has_initiator()
    }

    pub(crate) fn status_into(&self, s: &mut String) {
        if let Some(conn) = &self.conn {
            s.push_str(&format!("FD {}", conn.id()));
            if self.reader.is_some() {
                s.push('r');
            }
            if self.writer.is_some() {
                s.push('w');
            }
            s.push(';');
        }
        if self.connecting.is_some() {
            s.push_str("connecting;");
        }
        if self.comm_eof {
            s.push_str("Comm(Eof);");
        }
        if !self.is_retriable {
            s.push_str("R");
        }
        if !self.reuse_connection {
            s.push_str("Z");
        }
    }
}

/// The I/O skeleton of ICAP transactions. Implementors provide the protocol
/// part through the `handle_*` hooks.
pub(crate) trait IcapXaction: Initiate + Sized {
    fn xaction(&mut self) -> &mut XactionCore;
    fn xaction_ref(&self) -> &XactionCore;

    fn handle_comm_connected(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()>;
    fn handle_comm_wrote(&mut self, ctx: &mut JobContext<'_>, size: usize) -> anyhow::Result<()>;
    /// Called with new data appended to the read buffer, or on EOF.
    fn handle_comm_read(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()>;

    fn done_reading(&self) -> bool;

    fn done_writing(&self) -> bool {
        !self.xaction_ref().writing()
    }

    fn done_with_io(&self) -> bool {
        let core = self.xaction_ref();
        core.conn.is_some()
            && core.connecting.is_none()
            && core.reader.is_none()
            && core.writer.is_none()
            && self.done_reading()
            && self.done_writing()
    }

    fn may_read_more(&self) -> bool {
        let core = self.xaction_ref();
        !self.done_reading() && !core.comm_eof && core.read_buf.len() < READ_BUF_LIMIT
    }

    fn open_connection(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let core = self.xaction();
        if !core.reuse_connection {
            core.disable_retries();
        }

        let handle = ctx.handle::<Self>();
        let cb = handle.callback(
            "Xaction::noteCommConnected",
            |x: &mut Self, ctx, r: io::Result<Box<dyn IcapConnection>>| {
                x.note_comm_connected(ctx, r)
            },
        );
        core.connecting = Some(cb.canceller());

        if let Some(conn) = core.service.get_connection(core.is_retriable) {
            debug!(
                "reusing pconn {} to ICAP service {}",
                conn.id(),
                core.service.name()
            );
            cb.schedule(Ok(conn));
            return Ok(());
        }

        let timeout = core.service.config().connect_timeout;
        let call = handle.async_call("Xaction::noteCommTimedout", |x: &mut Self, ctx| {
            x.note_comm_timedout(ctx)
        });
        core.timeout = Some(ctx.scheduler().schedule_timer(timeout, call));

        let config = core.service.config();
        debug!(
            "connecting to ICAP service {} at {}:{}",
            core.service.name(),
            config.host(),
            config.port()
        );
        core.service
            .transport()
            .connect(config.host(), config.port(), cb);
        Ok(())
    }

    fn note_comm_connected(
        &mut self,
        ctx: &mut JobContext<'_>,
        r: io::Result<Box<dyn IcapConnection>>,
    ) -> anyhow::Result<()> {
        let core = self.xaction();
        core.connecting = None;
        core.cancel_timeout();
        match r {
            Ok(conn) => {
                core.conn = Some(conn);
                self.handle_comm_connected(ctx)
            }
            Err(e) => {
                core.service.note_connection_failed();
                Err(IcapXactError::from(IcapTransportError::ConnectFailed(e)).into())
            }
        }
    }

    fn schedule_write(&mut self, ctx: &mut JobContext<'_>, data: Vec<u8>) {
        let handle = ctx.handle::<Self>();
        let core = self.xaction();
        let Some(conn) = core.conn.as_mut() else {
            return;
        };
        let cb = handle.callback(
            "Xaction::noteCommWrote",
            |x: &mut Self, ctx, r: io::Result<usize>| x.note_comm_wrote(ctx, r),
        );
        core.writer = Some(cb.canceller());
        conn.write(Bytes::from(data), cb);
        self.update_timeout(ctx);
    }

    fn note_comm_wrote(
        &mut self,
        ctx: &mut JobContext<'_>,
        r: io::Result<usize>,
    ) -> anyhow::Result<()> {
        self.xaction().writer = None;
        let size = r.map_err(|e| IcapXactError::from(IcapTransportError::WriteFailed(e)))?;
        self.update_timeout(ctx);
        self.handle_comm_wrote(ctx, size)
    }

    fn schedule_read(&mut self, ctx: &mut JobContext<'_>) {
        let handle = ctx.handle::<Self>();
        let core = self.xaction();
        if core.reader.is_some() {
            return;
        }
        let Some(conn) = core.conn.as_mut() else {
            return;
        };
        let cb = handle.callback(
            "Xaction::noteCommRead",
            |x: &mut Self, ctx, r: io::Result<Bytes>| x.note_comm_read(ctx, r),
        );
        core.reader = Some(cb.canceller());
        conn.read(READ_SIZE, cb);
        self.update_timeout(ctx);
    }

    fn note_comm_read(&mut self, ctx: &mut JobContext<'_>, r: io::Result<Bytes>) -> anyhow::Result<()> {
        let core = self.xaction();
        core.reader = None;
        let data = r.map_err(|e| IcapXactError::from(IcapTransportError::ReadFailed(e)))?;
        if data.is_empty() {
            debug!("read EOF from ICAP service {}", core.service.name());
            core.comm_eof = true;
            core.reuse_connection = false;
            if core.bytes_read == 0 && core.is_retriable {
                // the server closed an idle persistent connection under us
                ctx.must_stop("pconn race");
                return Ok(());
            }
        } else {
            core.disable_retries();
            core.bytes_read += data.len() as u64;
            core.read_buf.extend_from_slice(&data);
        }
        self.update_timeout(ctx);
        self.handle_comm_read(ctx)
    }

    fn note_comm_timedout(&mut self, _ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let core = self.xaction();
        core.timeout = None;
        core.reuse_connection = false;
        if let Some(c) = core.connecting.take() {
            c.cancel("connect timed out");
            core.service.note_connection_failed();
            return Err(IcapXactError::from(IcapTransportError::ConnectTimeout).into());
        }
        self.close_connection();
        Err(IcapXactError::from(IcapTransportError::IoTimeout).into())
    }

    /// Arm the I/O timer while a read or write is pending.
    fn update_timeout(&mut self, ctx: &mut JobContext<'_>) {
        let handle = ctx.handle::<Self>();
        let core = self.xaction();
        core.cancel_timeout();
        if core.reader.is_some() || core.writer.is_some() {
            let call = handle.async_call("Xaction::noteCommTimedout", |x: &mut Self, ctx| {
                x.note_comm_timedout(ctx)
            });
            let timeout = core.service.config().io_timeout;
            core.timeout = Some(ctx.scheduler().schedule_timer(timeout, call));
        }
    }

    fn close_connection(&mut self) {
        self.xaction().cancel_read();
        let done_with_io = self.done_with_io();
        let core = self.xaction();
        core.cancel_timeout();
        let Some(conn) = core.conn.take() else {
            return;
        };
        if let Some(w) = core.writer.take() {
            w.cancel("closing");
            core.reuse_connection = false;
        }

        if core.reuse_connection && !done_with_io {
            debug!("not reusing pconn due to pending I/O");
            core.reuse_connection = false;
        }
        if core.reuse_connection {
            core.disable_retries();
        }
        let reset = !core.reuse_connection && core.failed;
        core.service.put_connection(conn, core.reuse_connection, reset);
    }

    fn xaction_call_exception(&mut self, ctx: &mut JobContext<'_>, e: anyhow::Error) {
        let core = self.xaction();
        core.failed = true;
        debug!(
            "ICAP transaction to {} failed: {e:#}",
            core.service.name()
        );
        core.service.note_failure();
        ctx.must_stop(format!("exception: {e:#}"));
    }

    fn xaction_swan_song(&mut self) {
        let core = self.xaction();
        if let Some(c) = core.connecting.take() {
            c.cancel("swan song");
            core.service.note_connection_failed();
        }
        self.close_connection();

        let core = self.xaction();
        core.read_buf.clear();
        if core.initiate.has_initiator() {
            let info = XactAbortInfo {
                retriable: core.is_retriable,
            };
            core.initiate.tell_xact_aborted(info);
        }
        core.initiate.swan_song();
    }
}
