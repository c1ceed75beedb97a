/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use http::Method;

use super::HttpLineParseError;
use crate::HttpProtocol;

pub struct HttpRequestLine<'a> {
    pub method: Method,
    pub uri: &'a str,
    pub protocol: HttpProtocol,
}

impl<'a> HttpRequestLine<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<HttpRequestLine<'a>, HttpLineParseError> {
        let line = std::str::from_utf8(buf)?.trim_end();

        let Some(p) = memchr::memchr(b' ', line.as_bytes()) else {
            return Err(HttpLineParseError::NoDelimiterFound(' '));
        };
        let method =
            Method::from_bytes(&line.as_bytes()[0..p]).map_err(|_| HttpLineParseError::InvalidMethod)?;

        let left = line[p + 1..].trim_start();
        let Some(p) = memchr::memrchr(b' ', left.as_bytes()) else {
            return Err(HttpLineParseError::NoDelimiterFound(' '));
        };
        let protocol = HttpProtocol::from_bytes(&left.as_bytes()[p + 1..])
            .ok_or(HttpLineParseError::InvalidVersion)?;
        let uri = left[0..p].trim_end();
        if uri.is_empty() {
            return Err(HttpLineParseError::NotLongEnough);
        }

        Ok(HttpRequestLine {
            method,
            uri,
            protocol,
        })
    }
}
