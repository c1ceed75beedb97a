/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kanal::{AsyncReceiver, AsyncSender};
use log::{debug, warn};
use socket2::{SockRef, Socket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

use g3_async_job::EventLoop;

use super::{ConnectCallback, IcapConnection, IcapTransport, ReadCallback, WriteCallback};

enum Completion {
    Connected {
        token: u64,
        result: io::Result<TcpStream>,
    },
    Wrote {
        token: u64,
        result: io::Result<usize>,
    },
    Read {
        token: u64,
        result: io::Result<Bytes>,
    },
}

enum Pending {
    Connect(ConnectCallback),
    Write(WriteCallback),
    Read(ReadCallback),
}

struct TransportShared {
    next_token: Cell<u64>,
    next_conn_id: Cell<u64>,
    // token -> (connection id, callback), connection id 0 is for connects
    pending: RefCell<HashMap<u64, (u64, Pending)>>,
    sender: AsyncSender<Completion>,
    receiver: AsyncReceiver<Completion>,
    stop: Cell<bool>,
}

impl TransportShared {
    fn add_pending(&self, conn_id: u64, p: Pending) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        self.pending.borrow_mut().insert(token, (conn_id, p));
        token
    }

    fn take_pending(&self, token: u64) -> Option<Pending> {
        self.pending.borrow_mut().remove(&token).map(|(_, p)| p)
    }

    fn forget_connection(&self, conn_id: u64) {
        self.pending.borrow_mut().retain(|_, (id, _)| *id != conn_id);
    }
}

/// Real sockets for the event loop.
///
/// Socket operations run as tokio tasks and their completions come back
/// through a channel, to be dispatched as calls by [`TcpTransport::drive`].
#[derive(Clone)]
pub struct TcpTransport {
    shared: Rc<TransportShared>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        let (sender, receiver) = kanal::unbounded_async();
        TcpTransport {
            shared: Rc::new(TransportShared {
                next_token: Cell::new(1),
                next_conn_id: Cell::new(1),
                pending: RefCell::new(HashMap::new()),
                sender,
                receiver,
                stop: Cell::new(false),
            }),
        }
    }

    /// Make [`TcpTransport::drive`] return once it is idle.
    pub fn request_stop(&self) {
        self.shared.stop.set(true);
    }

    /// Run the loop until no job is left or a stop is requested.
    ///
    /// Must be called within a tokio runtime, and the loop must use the
    /// system clock.
    pub async fn drive(&self, ev: &EventLoop) {
        loop {
            ev.run_until_idle();
            while let Ok(Some(c)) = self.shared.receiver.try_recv() {
                self.dispatch(c);
            }
            if ev.pending_calls() > 0 {
                continue;
            }
            if self.shared.stop.get() || ev.job_count() == 0 {
                break;
            }

            let r = match ev.next_deadline() {
                Some(deadline) => {
                    let deadline = tokio::time::Instant::from_std(deadline);
                    match tokio::time::timeout_at(deadline, self.shared.receiver.recv()).await {
                        Ok(r) => r,
                        Err(_) => continue,
                    }
                }
                None => self.shared.receiver.recv().await,
            };
            match r {
                Ok(c) => self.dispatch(c),
                Err(e) => {
                    warn!("tcp transport completion channel failed: {e}");
                    break;
                }
            }
        }
    }

    fn dispatch(&self, c: Completion) {
        match c {
            Completion::Connected { token, result } => {
                let Some(Pending::Connect(cb)) = self.shared.take_pending(token) else {
                    return;
                };
                if cb.is_cancelled() {
                    return;
                }
                let r = result.map(|stream| {
                    Box::new(TcpConnection::new(self.shared.clone(), stream))
                        as Box<dyn IcapConnection>
                });
                cb.schedule(r);
            }
            Completion::Wrote { token, result } => {
                if let Some(Pending::Write(cb)) = self.shared.take_pending(token) {
                    cb.schedule(result);
                }
            }
            Completion::Read { token, result } => {
                if let Some(Pending::Read(cb)) = self.shared.take_pending(token) {
                    cb.schedule(result);
                }
            }
        }
    }
}

impl IcapTransport for TcpTransport {
    fn connect(&self, host: &str, port: u16, callback: ConnectCallback) {
        let token = self.shared.add_pending(0, Pending::Connect(callback));
        let done = self.shared.sender.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            let result = TcpStream::connect((host.as_str(), port)).await;
            let _ = done.send(Completion::Connected { token, result }).await;
        });
    }
}

async fn run_reader(
    mut reader: OwnedReadHalf,
    cmds: AsyncReceiver<(u64, usize)>,
    done: AsyncSender<Completion>,
) {
    while let Ok((token, max_size)) = cmds.recv().await {
        let mut buf = BytesMut::with_capacity(max_size);
        let result = reader.read_buf(&mut buf).await.map(|_| buf.freeze());
        if done.send(Completion::Read { token, result }).await.is_err() {
            break;
        }
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    cmds: AsyncReceiver<(u64, Bytes)>,
    done: AsyncSender<Completion>,
) {
    while let Ok((token, data)) = cmds.recv().await {
        let result = writer.write_all(&data).await.map(|_| data.len());
        if done.send(Completion::Wrote { token, result }).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct TcpConnection {
    id: u64,
    shared: Rc<TransportShared>,
    read_cmd: AsyncSender<(u64, usize)>,
    write_cmd: AsyncSender<(u64, Bytes)>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    /// Shares the socket with the I/O tasks, for an abortive close.
    socket: Option<Socket>,
    open: bool,
}

impl TcpConnection {
    fn new(shared: Rc<TransportShared>, stream: TcpStream) -> Self {
        let id = shared.next_conn_id.get();
        shared.next_conn_id.set(id + 1);
        let _ = stream.set_nodelay(true);
        let socket = match SockRef::from(&stream).try_clone() {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("failed to duplicate icap tcp connection {id}: {e}");
                None
            }
        };
        let (r, w) = stream.into_split();

        let (read_cmd, read_cmd_r) = kanal::unbounded_async();
        let (write_cmd, write_cmd_r) = kanal::unbounded_async();
        let reader = tokio::spawn(run_reader(r, read_cmd_r, shared.sender.clone()));
        let writer = tokio::spawn(run_writer(w, write_cmd_r, shared.sender.clone()));
        debug!("icap tcp connection {id} established");
        TcpConnection {
            id,
            shared,
            read_cmd,
            write_cmd,
            reader,
            writer,
            socket,
            open: true,
        }
    }
}

impl IcapConnection for TcpConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&mut self, data: Bytes, callback: WriteCallback) {
        if !self.open {
            callback.schedule(Err(io::Error::from(io::ErrorKind::NotConnected)));
            return;
        }
        let token = self.shared.add_pending(self.id, Pending::Write(callback));
        if self.write_cmd.try_send((token, data)).is_err() {
            if let Some(Pending::Write(cb)) = self.shared.take_pending(token) {
                cb.schedule(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
        }
    }

    fn read(&mut self, max_size: usize, callback: ReadCallback) {
        if !self.open {
            callback.schedule(Err(io::Error::from(io::ErrorKind::NotConnected)));
            return;
        }
        let token = self.shared.add_pending(self.id, Pending::Read(callback));
        if self.read_cmd.try_send((token, max_size)).is_err() {
            if let Some(Pending::Read(cb)) = self.shared.take_pending(token) {
                cb.schedule(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
        }
    }

    fn close(&mut self, reset: bool) {
        if !self.open {
            return;
        }
        self.open = false;
        debug!("closing icap tcp connection {}, reset: {reset}", self.id);
        if let Some(socket) = self.socket.take() {
            // the last close of a zero linger socket sends RST
            if reset {
                if let Err(e) = socket.set_linger(Some(Duration::ZERO)) {
                    warn!("failed to reset icap tcp connection {}: {e}", self.id);
                }
            }
        }
        self.reader.abort();
        self.writer.abort();
        self.shared.forget_connection(self.id);
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close(false);
    }
}
