/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::str::FromStr;
use std::time::{Duration, Instant};

use atoi::FromRadix10Checked;
use chrono::{DateTime, Utc};
use http::HeaderName;
use log::debug;
use thiserror::Error;

use g3_http::{HttpHead, HttpProtocol};

use crate::config::IcapMethod;

mod xact;
pub(crate) use xact::OptXact;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IcapOptionsParseError {
    #[error("not an ICAP response")]
    NotIcapResponse,
    #[error("request failed: {0} {1}")]
    RequestFailed(u16, String),
    #[error("no ISTag set")]
    NoServiceTagSet,
    #[error("invalid value for header {0}")]
    InvalidHeaderValue(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Preview,
    Ignore,
    Complete,
}

#[derive(Default)]
struct TransferList {
    extensions: Vec<String>,
    wildcard: bool,
}

impl TransferList {
    fn parse(value: &str) -> Self {
        let mut list = TransferList::default();
        for ext in value.split(',') {
            let ext = ext.trim();
            if ext.is_empty() {
                continue;
            }
            if ext == "*" {
                list.wildcard = true;
            } else {
                list.extensions.push(ext.to_ascii_lowercase());
            }
        }
        list
    }

    fn matches(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e == ext)
    }
}

fn url_path_extension(url_path: &str) -> Option<String> {
    let path = url_path.as_bytes();
    let name_start = memchr::memrchr(b'/', path).map(|p| p + 1).unwrap_or(0);
    let name = &path[name_start..];
    let dot = memchr::memrchr(b'.', name)?;
    let ext = &url_path[name_start + dot + 1..];
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    let b = value.trim().as_bytes();
    match u64::from_radix_10_checked(b) {
        (Some(v), len) if len == b.len() && len > 0 => Some(v),
        _ => None,
    }
}

/// What a service told us about itself in its OPTIONS response.
pub struct IcapServiceOptions {
    istag: Option<String>,
    service: Option<String>,
    methods: Vec<IcapMethod>,
    max_connections: Option<usize>,
    allow_204: bool,
    allow_206: bool,
    preview_size: Option<usize>,
    ttl: Duration,
    fetched_at: Instant,
    date: Option<DateTime<Utc>>,
    transfer_preview: TransferList,
    transfer_ignore: TransferList,
    transfer_complete: TransferList,
    error: Option<IcapOptionsParseError>,
}

impl IcapServiceOptions {
    fn empty(fetched_at: Instant, default_ttl: Duration) -> Self {
        IcapServiceOptions {
            istag: None,
            service: None,
            methods: Vec::new(),
            max_connections: None,
            allow_204: false,
            allow_206: false,
            preview_size: None,
            ttl: default_ttl,
            fetched_at,
            date: None,
            transfer_preview: TransferList::default(),
            transfer_ignore: TransferList::default(),
            transfer_complete: TransferList::default(),
            error: None,
        }
    }

    /// Parse an OPTIONS response head. Problems are recorded, not returned,
    /// so that the update schedule still has a timestamp to work with.
    pub fn parse(head: &HttpHead, fetched_at: Instant, default_ttl: Duration) -> Self {
        let mut o = IcapServiceOptions::empty(fetched_at, default_ttl);
        if let Err(e) = o.configure(head) {
            debug!("invalid ICAP OPTIONS response: {e}");
            o.error = Some(e);
        }
        o
    }

    fn configure(&mut self, head: &HttpHead) -> Result<(), IcapOptionsParseError> {
        if head.protocol() != HttpProtocol::Icap10 {
            return Err(IcapOptionsParseError::NotIcapResponse);
        }
        let Some(code) = head.status_code() else {
            return Err(IcapOptionsParseError::NotIcapResponse);
        };
        if code != 200 {
            let reason = match head.start_line() {
                g3_http::HttpStartLine::Status { reason, .. } => reason.clone(),
                _ => String::new(),
            };
            return Err(IcapOptionsParseError::RequestFailed(code, reason));
        }

        match head.header_str("istag") {
            Some(v) if !v.trim().is_empty() => self.istag = Some(v.trim().to_string()),
            _ => return Err(IcapOptionsParseError::NoServiceTagSet),
        }
        self.service = head.header_str("service").map(|s| s.to_string());

        if let Some(v) = head.header_str("methods") {
            for m in v.split(',') {
                match IcapMethod::from_str(m.trim()) {
                    Ok(method) => self.methods.push(method),
                    Err(_) => debug!("ignoring unknown ICAP method {m} in OPTIONS response"),
                }
            }
        }

        if let Some(v) = head.header_str("max-connections") {
            match parse_u64(v) {
                Some(n) if n > 0 => self.max_connections = usize::try_from(n).ok(),
                _ => return Err(IcapOptionsParseError::InvalidHeaderValue("Max-Connections")),
            }
        }

        if let Some(v) = head.header_str("options-ttl") {
            let ttl = parse_u64(v)
                .ok_or(IcapOptionsParseError::InvalidHeaderValue("Options-TTL"))?;
            self.ttl = Duration::from_secs(ttl);
        }

        if let Some(v) = head.header_str("date") {
            match DateTime::parse_from_rfc2822(v) {
                Ok(d) => self.date = Some(d.with_timezone(&Utc)),
                Err(e) => debug!("invalid Date {v} in OPTIONS response: {e}"),
            }
        }

        if let Some(v) = head.header_str("preview") {
            let size = parse_u64(v).ok_or(IcapOptionsParseError::InvalidHeaderValue("Preview"))?;
            self.preview_size = usize::try_from(size).ok();
        }

        let allow = HeaderName::from_static("allow");
        self.allow_204 = head.has_list_member(&allow, "204");
        self.allow_206 = head.has_list_member(&allow, "206");

        if let Some(v) = head.header_str("transfer-preview") {
            self.transfer_preview = TransferList::parse(v);
        }
        if let Some(v) = head.header_str("transfer-ignore") {
            self.transfer_ignore = TransferList::parse(v);
        }
        if let Some(v) = head.header_str("transfer-complete") {
            self.transfer_complete = TransferList::parse(v);
        }
        Ok(())
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&IcapOptionsParseError> {
        self.error.as_ref()
    }

    pub fn istag(&self) -> Option<&str> {
        self.istag.as_deref()
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn methods(&self) -> &[IcapMethod] {
        &self.methods
    }

    #[inline]
    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    #[inline]
    pub fn allow_204(&self) -> bool {
        self.allow_204
    }

    #[inline]
    pub fn allow_206(&self) -> bool {
        self.allow_206
    }

    #[inline]
    pub fn preview_size(&self) -> Option<usize> {
        self.preview_size
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    pub fn expire(&self) -> Instant {
        self.fetched_at + self.ttl
    }

    pub fn fresh(&self, now: Instant) -> bool {
        now < self.expire()
    }

    /// How the service wants a body with this URL path to be sent.
    pub fn transfer_kind(&self, url_path: &str) -> TransferKind {
        if let Some(ext) = url_path_extension(url_path) {
            if self.transfer_preview.matches(&ext) {
                return TransferKind::Preview;
            }
            if self.transfer_ignore.matches(&ext) {
                return TransferKind::Ignore;
            }
            if self.transfer_complete.matches(&ext) {
                return TransferKind::Complete;
            }
        }
        if self.transfer_ignore.wildcard {
            TransferKind::Ignore
        } else if self.transfer_complete.wildcard {
            TransferKind::Complete
        } else {
            TransferKind::Preview
        }
    }
}
