/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

mod chunked_encoder;
pub use chunked_encoder::ChunkedEncoder;

mod chunked_decoder;
pub use chunked_decoder::{ChunkedDecodeError, ChunkedDecodeStatus, ChunkedDecoder, ChunkedSink};
