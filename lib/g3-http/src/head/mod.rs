/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io::Write;

use atoi::FromRadix10Checked;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method};

use crate::HttpProtocol;
use crate::parse::{HttpHeaderLine, HttpLineParseError, HttpRequestLine, HttpStatusLine};

mod error;
pub use error::HttpHeadParseError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HttpStartLine {
    Request {
        method: Method,
        uri: String,
        protocol: HttpProtocol,
    },
    Status {
        protocol: HttpProtocol,
        code: u16,
        reason: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpBodySize {
    Known(u64),
    Unknown,
}

/// The head of an HTTP or ICAP message: start line and header fields.
#[derive(Clone, Debug)]
pub struct HttpHead {
    start_line: HttpStartLine,
    headers: HeaderMap,
    hdr_size: usize,
}

impl HttpHead {
    pub fn new_request(method: Method, uri: &str, protocol: HttpProtocol) -> Self {
        HttpHead {
            start_line: HttpStartLine::Request {
                method,
                uri: uri.to_string(),
                protocol,
            },
            headers: HeaderMap::new(),
            hdr_size: 0,
        }
    }

    pub fn new_response(protocol: HttpProtocol, code: u16, reason: &str) -> Self {
        HttpHead {
            start_line: HttpStartLine::Status {
                protocol,
                code,
                reason: reason.to_string(),
            },
            headers: HeaderMap::new(),
            hdr_size: 0,
        }
    }

    /// Parse a complete head from the start of `buf`.
    ///
    /// Returns `Ok(None)` if the terminating empty line has not been seen
    /// yet and more data may still arrive.
    pub fn parse(
        buf: &[u8],
        eof: bool,
        max_size: usize,
    ) -> Result<Option<HttpHead>, HttpHeadParseError> {
        let mut offset = 0usize;
        let mut start_line: Option<HttpStartLine> = None;
        let mut headers = HeaderMap::new();

        loop {
            let left = &buf[offset..];
            let Some(p) = memchr::memchr(b'\n', left) else {
                if buf.len() > max_size {
                    return Err(HttpHeadParseError::TooLargeHeader(max_size));
                }
                return if eof {
                    Err(HttpHeadParseError::UnexpectedEof)
                } else {
                    Ok(None)
                };
            };
            let line = &left[..=p];
            offset += p + 1;
            if offset > max_size {
                return Err(HttpHeadParseError::TooLargeHeader(max_size));
            }

            let Some(start) = start_line.take() else {
                start_line = Some(Self::parse_start_line(line)?);
                continue;
            };
            if line == b"\r\n" || line == b"\n" {
                return Ok(Some(HttpHead {
                    start_line: start,
                    headers,
                    hdr_size: offset,
                }));
            }
            start_line = Some(start);

            let header = HttpHeaderLine::parse(line).map_err(HttpHeadParseError::InvalidHeaderLine)?;
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| {
                HttpHeadParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderName)
            })?;
            let value = HeaderValue::from_bytes(header.value.as_bytes()).map_err(|_| {
                HttpHeadParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderValue)
            })?;
            headers.append(name, value);
        }
    }

    fn parse_start_line(line: &[u8]) -> Result<HttpStartLine, HttpHeadParseError> {
        if line.starts_with(b"HTTP/") || line.starts_with(b"ICAP/") {
            let status = HttpStatusLine::parse(line).map_err(HttpHeadParseError::InvalidStartLine)?;
            Ok(HttpStartLine::Status {
                protocol: status.protocol,
                code: status.code,
                reason: status.reason.to_string(),
            })
        } else {
            let req = HttpRequestLine::parse(line).map_err(HttpHeadParseError::InvalidStartLine)?;
            Ok(HttpStartLine::Request {
                method: req.method,
                uri: req.uri.to_string(),
                protocol: req.protocol,
            })
        }
    }

    #[inline]
    pub fn start_line(&self) -> &HttpStartLine {
        &self.start_line
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, HttpStartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start_line {
            HttpStartLine::Request { method, .. } => Some(method),
            HttpStartLine::Status { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.start_line {
            HttpStartLine::Request { uri, .. } => Some(uri),
            HttpStartLine::Status { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            HttpStartLine::Request { .. } => None,
            HttpStartLine::Status { code, .. } => Some(*code),
        }
    }

    pub fn protocol(&self) -> HttpProtocol {
        match &self.start_line {
            HttpStartLine::Request { protocol, .. } => *protocol,
            HttpStartLine::Status { protocol, .. } => *protocol,
        }
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Size of the head on the wire, known after parsing.
    #[inline]
    pub fn hdr_size(&self) -> usize {
        self.hdr_size
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Check whether a comma separated header contains the token.
    pub fn has_list_member(&self, name: &HeaderName, token: &str) -> bool {
        self.headers.get_all(name).iter().any(|v| {
            v.to_str().is_ok_and(|s| {
                s.split(',')
                    .any(|member| member.trim().eq_ignore_ascii_case(token))
            })
        })
    }

    pub fn content_length(&self) -> Option<u64> {
        let v = self.headers.get(header::CONTENT_LENGTH)?;
        let (len, size) = u64::from_radix_10_checked(v.as_bytes());
        match len {
            Some(len) if size == v.len() && size > 0 => Some(len),
            _ => None,
        }
    }

    fn is_chunked(&self) -> bool {
        self.has_list_member(&header::TRANSFER_ENCODING, "chunked")
    }

    /// Whether a body follows this head, and its size if it is known.
    ///
    /// `request_method` is the method of the request a response answers.
    pub fn expecting_body(&self, request_method: Option<&Method>) -> Option<HttpBodySize> {
        match &self.start_line {
            HttpStartLine::Request { .. } => {
                if self.is_chunked() {
                    Some(HttpBodySize::Unknown)
                } else {
                    self.content_length().map(HttpBodySize::Known)
                }
            }
            HttpStartLine::Status { code, .. } => {
                if request_method == Some(&Method::HEAD) {
                    return None;
                }
                if (100..200).contains(code) || *code == 204 || *code == 304 {
                    return None;
                }
                if self.is_chunked() {
                    return Some(HttpBodySize::Unknown);
                }
                match self.content_length() {
                    Some(len) => Some(HttpBodySize::Known(len)),
                    None => Some(HttpBodySize::Unknown),
                }
            }
        }
    }

    /// Drop the fields that only make sense on a single hop.
    pub fn remove_hop_by_hop_headers(&mut self) {
        let listed: Vec<HeaderName> = self
            .headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|s| s.split(','))
            .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
            .collect();
        for name in listed {
            self.headers.remove(name);
        }
        for name in [
            header::CONNECTION,
            header::PROXY_AUTHENTICATE,
            header::PROXY_AUTHORIZATION,
            header::TE,
            header::TRAILER,
            header::TRANSFER_ENCODING,
            header::UPGRADE,
        ] {
            self.headers.remove(name);
        }
        self.headers.remove("keep-alive");
        self.headers.remove("proxy-connection");
    }

    pub fn pack_into(&self, buf: &mut Vec<u8>) {
        match &self.start_line {
            HttpStartLine::Request {
                method,
                uri,
                protocol,
            } => {
                let _ = write!(buf, "{method} {uri} {protocol}\r\n");
            }
            HttpStartLine::Status {
                protocol,
                code,
                reason,
            } => {
                if reason.is_empty() {
                    let _ = write!(buf, "{protocol} {code}\r\n");
                } else {
                    let _ = write!(buf, "{protocol} {code} {reason}\r\n");
                }
            }
        }
        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
    }

    pub fn packed_size(&self) -> usize {
        let mut buf = Vec::with_capacity(256);
        self.pack_into(&mut buf);
        buf.len()
    }
}
