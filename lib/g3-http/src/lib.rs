/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

pub mod parse;

mod protocol;
pub use protocol::HttpProtocol;

mod head;
pub use head::{HttpBodySize, HttpHead, HttpHeadParseError, HttpStartLine};

mod body;
pub use body::{
    ChunkedDecodeError, ChunkedDecodeStatus, ChunkedDecoder, ChunkedEncoder, ChunkedSink,
};
