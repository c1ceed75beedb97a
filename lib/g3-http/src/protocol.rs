/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpProtocol {
    Http10,
    Http11,
    Icap10,
}

impl HttpProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpProtocol::Http10 => "HTTP/1.0",
            HttpProtocol::Http11 => "HTTP/1.1",
            HttpProtocol::Icap10 => "ICAP/1.0",
        }
    }

    pub(crate) fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"HTTP/1.0" => Some(HttpProtocol::Http10),
            b"HTTP/1.1" => Some(HttpProtocol::Http11),
            b"ICAP/1.0" => Some(HttpProtocol::Icap10),
            _ => None,
        }
    }

    #[inline]
    pub fn is_icap(&self) -> bool {
        matches!(self, HttpProtocol::Icap10)
    }
}

impl fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
