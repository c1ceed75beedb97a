/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;

use bytes::Bytes;

use g3_async_job::AsyncCallback;

mod tcp;
pub use tcp::TcpTransport;

#[cfg(test)]
pub(crate) mod mock;

pub type ConnectCallback = AsyncCallback<io::Result<Box<dyn IcapConnection>>>;
pub type WriteCallback = AsyncCallback<io::Result<usize>>;
/// An empty buffer means the peer closed its side.
pub type ReadCallback = AsyncCallback<io::Result<Bytes>>;

/// Opens connections to ICAP servers.
///
/// Completions are delivered by scheduling the callback on the event loop.
/// A cancelled callback is simply never dialed.
pub trait IcapTransport {
    fn connect(&self, host: &str, port: u16, callback: ConnectCallback);
}

/// One ICAP connection, with at most one pending write and one pending
/// read at a time.
pub trait IcapConnection {
    fn id(&self) -> u64;

    /// Write all of `data`, then report the written size.
    fn write(&mut self, data: Bytes, callback: WriteCallback);

    /// Read up to `max_size` bytes.
    fn read(&mut self, max_size: usize, callback: ReadCallback);

    /// `reset` asks for an abortive close.
    fn close(&mut self, reset: bool);

    fn is_open(&self) -> bool;
}
