/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;

use thiserror::Error;

use g3_http::{ChunkedDecodeError, HttpHeadParseError};

use super::{IcapEncapsulatedError, IcapErrorReason};

#[derive(Debug, Error)]
pub enum IcapTransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("i/o timed out")]
    IoTimeout,
    #[error("write failed: {0}")]
    WriteFailed(io::Error),
    #[error("read failed: {0}")]
    ReadFailed(io::Error),
}

#[derive(Debug, Error)]
pub enum IcapXactError {
    #[error("transport: {0}")]
    Transport(#[from] IcapTransportError),
    #[error("protocol: {0}")]
    Protocol(IcapErrorReason),
    #[error("invalid ICAP response head: {0}")]
    InvalidIcapHead(HttpHeadParseError),
    #[error("invalid encapsulated HTTP head: {0}")]
    InvalidHttpHead(HttpHeadParseError),
    #[error("invalid Encapsulated header: {0}")]
    InvalidEncapsulated(#[from] IcapEncapsulatedError),
    #[error("invalid ICAP body: {0}")]
    InvalidBody(#[from] ChunkedDecodeError),
}

impl From<IcapErrorReason> for IcapXactError {
    fn from(reason: IcapErrorReason) -> Self {
        IcapXactError::Protocol(reason)
    }
}

impl IcapXactError {
    pub fn is_transport(&self) -> bool {
        matches!(self, IcapXactError::Transport(_))
    }
}
