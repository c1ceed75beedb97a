/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::str::Utf8Error;

use thiserror::Error;

/// Errors found in a single line of an HTTP or ICAP head, or in a chunk-size
/// line.
#[derive(Debug, Error)]
pub enum HttpLineParseError {
    #[error("line is too short")]
    NotLongEnough,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("line is not valid utf-8: {0}")]
    InvalidUtf8Encoding(#[from] Utf8Error),
    #[error("delimiter '{0}' not found")]
    NoDelimiterFound(char),
    #[error("empty header name")]
    MissingHeaderName,
    #[error("malformed header name")]
    InvalidHeaderName,
    #[error("malformed header value")]
    InvalidHeaderValue,
    #[error("unsupported request method")]
    InvalidMethod,
    #[error("unsupported protocol version")]
    InvalidVersion,
    #[error("malformed status code")]
    InvalidStatusCode,
    /// Not hex, empty, or overflowing 64 bits.
    #[error("malformed chunk size")]
    InvalidChunkSize,
}
