/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use thiserror::Error;

use crate::parse::HttpLineParseError;

#[derive(Debug, Error)]
pub enum HttpHeadParseError {
    #[error("too large header, should be less than {0}")]
    TooLargeHeader(usize),
    #[error("invalid start line: {0}")]
    InvalidStartLine(HttpLineParseError),
    #[error("invalid header line: {0}")]
    InvalidHeaderLine(HttpLineParseError),
    #[error("closed before the end of header")]
    UnexpectedEof,
}
