/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use super::{ConnectCallback, IcapConnection, IcapTransport, ReadCallback, WriteCallback};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectPlan {
    Accept,
    Refuse,
}

#[derive(Default)]
struct MockConn {
    written: Vec<u8>,
    inbox: BytesMut,
    eof: bool,
    closed: bool,
    reset: bool,
    pending_read: Option<(usize, ReadCallback)>,
}

impl MockConn {
    fn try_complete_read(&mut self) {
        let Some((max, cb)) = self.pending_read.take() else {
            return;
        };
        if !self.inbox.is_empty() {
            let n = max.min(self.inbox.len());
            cb.schedule(Ok(self.inbox.split_to(n).freeze()));
        } else if self.eof {
            cb.schedule(Ok(Bytes::new()));
        } else {
            self.pending_read = Some((max, cb));
        }
    }
}

#[derive(Default)]
struct MockState {
    plan: VecDeque<ConnectPlan>,
    attempts: usize,
    conns: Vec<MockConn>,
}

/// A scripted ICAP server living in memory.
///
/// Connections are numbered in accept order. Writes complete at once; reads
/// complete when the test pushes data or EOF.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        MockTransport::default()
    }

    /// Outcomes of the next connect attempts. Unplanned attempts succeed.
    pub(crate) fn plan(&self, plan: &[ConnectPlan]) {
        self.state.borrow_mut().plan.extend(plan.iter().copied());
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.state.borrow().attempts
    }

    pub(crate) fn connections(&self) -> usize {
        self.state.borrow().conns.len()
    }

    pub(crate) fn take_written(&self, i: usize) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().conns[i].written)
    }

    pub(crate) fn push(&self, i: usize, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        let conn = &mut state.conns[i];
        conn.inbox.extend_from_slice(data);
        conn.try_complete_read();
    }

    pub(crate) fn push_eof(&self, i: usize) {
        let mut state = self.state.borrow_mut();
        let conn = &mut state.conns[i];
        conn.eof = true;
        conn.try_complete_read();
    }

    pub(crate) fn is_open(&self, i: usize) -> bool {
        !self.state.borrow().conns[i].closed
    }

    pub(crate) fn was_reset(&self, i: usize) -> bool {
        self.state.borrow().conns[i].reset
    }

    pub(crate) fn has_pending_read(&self, i: usize) -> bool {
        self.state.borrow().conns[i].pending_read.is_some()
    }
}

impl IcapTransport for MockTransport {
    fn connect(&self, _host: &str, _port: u16, callback: ConnectCallback) {
        let mut state = self.state.borrow_mut();
        state.attempts += 1;
        match state.plan.pop_front().unwrap_or(ConnectPlan::Accept) {
            ConnectPlan::Accept => {
                let index = state.conns.len();
                state.conns.push(MockConn::default());
                let conn = MockConnection {
                    index,
                    state: self.state.clone(),
                };
                callback.schedule(Ok(Box::new(conn)));
            }
            ConnectPlan::Refuse => {
                callback.schedule(Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
        }
    }
}

struct MockConnection {
    index: usize,
    state: Rc<RefCell<MockState>>,
}

impl IcapConnection for MockConnection {
    fn id(&self) -> u64 {
        self.index as u64
    }

    fn write(&mut self, data: Bytes, callback: WriteCallback) {
        let mut state = self.state.borrow_mut();
        let conn = &mut state.conns[self.index];
        if conn.closed {
            callback.schedule(Err(io::Error::from(io::ErrorKind::NotConnected)));
            return;
        }
        conn.written.extend_from_slice(&data);
        callback.schedule(Ok(data.len()));
    }

    fn read(&mut self, max_size: usize, callback: ReadCallback) {
        let mut state = self.state.borrow_mut();
        let conn = &mut state.conns[self.index];
        if let Some((_, old)) = &conn.pending_read {
            assert!(old.is_cancelled(), "concurrent reads");
        }
        conn.pending_read = Some((max_size, callback));
        conn.try_complete_read();
    }

    fn close(&mut self, reset: bool) {
        let mut state = self.state.borrow_mut();
        let conn = &mut state.conns[self.index];
        conn.closed = true;
        conn.reset = reset;
        conn.pending_read = None;
    }

    fn is_open(&self) -> bool {
        !self.state.borrow().conns[self.index].closed
    }
}
