/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcapErrorReason {
    UnknownResponse,
    UnexpectedContinue,
    ContinueAfterPreviewEof,
    NoHttpHeadFound,
    Unexpected204,
    Unexpected206,
    ConnectionClosed,
    TruncatedBody,
    NotIcapResponse,
    ServiceUnusable,
}

impl IcapErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IcapErrorReason::UnknownResponse => "unknown ICAP response code",
            IcapErrorReason::UnexpectedContinue => "unexpected 100-continue response",
            IcapErrorReason::ContinueAfterPreviewEof => {
                "invalid 100-continue response as preview is eof"
            }
            IcapErrorReason::NoHttpHeadFound => "no encapsulated HTTP head found",
            IcapErrorReason::Unexpected204 => "204 response while the virgin body is gone",
            IcapErrorReason::Unexpected206 => "206 response that was not allowed",
            IcapErrorReason::ConnectionClosed => "ICAP connection closed before the response",
            IcapErrorReason::TruncatedBody => "ICAP connection closed in the middle of body",
            IcapErrorReason::NotIcapResponse => "not an ICAP response",
            IcapErrorReason::ServiceUnusable => "ICAP service is unusable",
        }
    }
}

impl fmt::Display for IcapErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
