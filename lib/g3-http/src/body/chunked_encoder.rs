/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io::Write;

/// Chunked transfer coding writer, with the ICAP `ieof` extension.
pub struct ChunkedEncoder;

impl ChunkedEncoder {
    pub fn open_chunk(buf: &mut Vec<u8>, chunk_size: usize) {
        let _ = write!(buf, "{chunk_size:x}\r\n");
    }

    pub fn close_chunk(buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"\r\n");
    }

    /// Frame `data` as a single chunk. Empty data writes nothing as an
    /// empty chunk would be taken as the last one.
    pub fn write_chunk(buf: &mut Vec<u8>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        Self::open_chunk(buf, data.len());
        buf.extend_from_slice(data);
        Self::close_chunk(buf);
    }

    pub fn write_last_chunk(buf: &mut Vec<u8>, ieof: bool) {
        if ieof {
            buf.extend_from_slice(b"0; ieof\r\n\r\n");
        } else {
            buf.extend_from_slice(b"0\r\n\r\n");
        }
    }
}
