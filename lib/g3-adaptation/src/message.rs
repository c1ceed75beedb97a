/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::net::IpAddr;
use std::rc::Rc;

use http::Method;

use g3_body_pipe::BodyPipe;
use g3_http::{HttpHead, HttpHeadParseError};

/// An HTTP message travelling through adaptation.
#[derive(Clone)]
pub struct AdaptationMessage {
    pub head: HttpHead,
    pub body: Option<BodyPipe>,
    /// The request a response answers, for RESPMOD.
    pub cause: Option<Rc<HttpHead>>,
    pub client_addr: Option<IpAddr>,
    pub client_username: Option<String>,
}

impl AdaptationMessage {
    pub fn new(head: HttpHead, body: Option<BodyPipe>) -> Self {
        AdaptationMessage {
            head,
            body,
            cause: None,
            client_addr: None,
            client_username: None,
        }
    }

    pub fn with_cause(mut self, cause: Rc<HttpHead>) -> Self {
        self.cause = Some(cause);
        self
    }

    /// The request head: our own head, or the cause of a response.
    pub fn request_head(&self) -> Option<&HttpHead> {
        if self.head.is_request() {
            Some(&self.head)
        } else {
            self.cause.as_deref()
        }
    }

    pub fn request_method(&self) -> Option<&Method> {
        self.request_head().and_then(|h| h.method())
    }

    /// Path of the request URI, used for per-extension decisions.
    pub fn request_path(&self) -> Option<String> {
        let uri = self.request_head()?.uri()?;
        let uri = uri.parse::<http::Uri>().ok()?;
        Some(uri.path().to_string())
    }

    /// A structurally independent copy of the head, made by packing it and
    /// parsing the result back.
    pub fn clone_head(&self) -> Result<HttpHead, HttpHeadParseError> {
        let mut buf = Vec::with_capacity(self.head.packed_size());
        self.head.pack_into(&mut buf);
        let head = HttpHead::parse(&buf, true, buf.len())?
            .ok_or(HttpHeadParseError::UnexpectedEof)?;
        if head.hdr_size() != buf.len() {
            return Err(HttpHeadParseError::TooLargeHeader(buf.len()));
        }
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use g3_http::HttpProtocol;

    #[test]
    fn cloned_head_is_independent() {
        let mut head = HttpHead::new_response(HttpProtocol::Http11, 200, "OK");
        head.headers_mut()
            .insert(http::header::CONTENT_LENGTH, "12".parse().unwrap());
        let msg = AdaptationMessage::new(head, None);

        let mut copy = msg.clone_head().unwrap();
        assert_eq!(copy.status_code(), Some(200));
        assert_eq!(copy.content_length(), Some(12));
        copy.headers_mut()
            .insert(http::header::CONTENT_LENGTH, "3".parse().unwrap());
        assert_eq!(msg.head.content_length(), Some(12));
    }

    #[test]
    fn request_from_cause() {
        let req = HttpHead::new_request(
            Method::GET,
            "http://example.net/a/b.jpg?x=1",
            HttpProtocol::Http11,
        );
        let rsp = HttpHead::new_response(HttpProtocol::Http11, 200, "OK");
        let msg = AdaptationMessage::new(rsp, None).with_cause(Rc::new(req));
        assert_eq!(msg.request_method(), Some(&Method::GET));
        assert_eq!(msg.request_path().as_deref(), Some("/a/b.jpg"));

        let orphan = AdaptationMessage::new(
            HttpHead::new_response(HttpProtocol::Http11, 204, ""),
            None,
        );
        assert!(orphan.request_method().is_none());
    }
}
