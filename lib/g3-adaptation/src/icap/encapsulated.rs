/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io::Write;

use atoi::FromRadix10Checked;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IcapEncapsulatedError {
    #[error("empty value")]
    EmptyValue,
    #[error("invalid entry {0}")]
    InvalidEntry(String),
    #[error("unknown section {0}")]
    UnknownSection(String),
    #[error("duplicate section {0}")]
    DuplicateSection(&'static str),
    #[error("offsets are not increasing")]
    UnorderedOffset,
    #[error("body section is not the last one")]
    BodyNotLast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcapBodyKind {
    ReqBody,
    ResBody,
    OptBody,
    NullBody,
}

impl IcapBodyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IcapBodyKind::ReqBody => "req-body",
            IcapBodyKind::ResBody => "res-body",
            IcapBodyKind::OptBody => "opt-body",
            IcapBodyKind::NullBody => "null-body",
        }
    }

    /// Whether chunked data follows the encapsulated heads.
    pub fn has_data(&self) -> bool {
        !matches!(self, IcapBodyKind::NullBody)
    }
}

/// Section offsets carried by the `Encapsulated` header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IcapEncapsulated {
    req_hdr: Option<usize>,
    res_hdr: Option<usize>,
    body: Option<(IcapBodyKind, usize)>,
}

impl IcapEncapsulated {
    pub fn parse(value: &str) -> Result<Self, IcapEncapsulatedError> {
        let mut r = IcapEncapsulated::default();
        let mut last_offset = 0usize;
        let mut entries = 0usize;

        for entry in value.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if r.body.is_some() {
                return Err(IcapEncapsulatedError::BodyNotLast);
            }
            let Some((name, offset)) = entry.split_once('=') else {
                return Err(IcapEncapsulatedError::InvalidEntry(entry.to_string()));
            };
            let offset = offset.trim().as_bytes();
            let (v, len) = usize::from_radix_10_checked(offset);
            let offset = match v {
                Some(v) if len == offset.len() && len > 0 => v,
                _ => return Err(IcapEncapsulatedError::InvalidEntry(entry.to_string())),
            };
            if offset < last_offset {
                return Err(IcapEncapsulatedError::UnorderedOffset);
            }
            last_offset = offset;
            entries += 1;

            match name.trim().to_ascii_lowercase().as_str() {
                "req-hdr" => {
                    if r.req_hdr.replace(offset).is_some() {
                        return Err(IcapEncapsulatedError::DuplicateSection("req-hdr"));
                    }
                }
                "res-hdr" => {
                    if r.res_hdr.replace(offset).is_some() {
                        return Err(IcapEncapsulatedError::DuplicateSection("res-hdr"));
                    }
                }
                "req-body" => r.body = Some((IcapBodyKind::ReqBody, offset)),
                "res-body" => r.body = Some((IcapBodyKind::ResBody, offset)),
                "opt-body" => r.body = Some((IcapBodyKind::OptBody, offset)),
                "null-body" => r.body = Some((IcapBodyKind::NullBody, offset)),
                s => return Err(IcapEncapsulatedError::UnknownSection(s.to_string())),
            }
        }

        if entries == 0 {
            return Err(IcapEncapsulatedError::EmptyValue);
        }
        Ok(r)
    }

    #[inline]
    pub fn req_hdr(&self) -> Option<usize> {
        self.req_hdr
    }

    #[inline]
    pub fn res_hdr(&self) -> Option<usize> {
        self.res_hdr
    }

    #[inline]
    pub fn body_kind(&self) -> Option<IcapBodyKind> {
        self.body.map(|(kind, _)| kind)
    }

    pub fn has_http_head(&self) -> bool {
        self.req_hdr.is_some() || self.res_hdr.is_some()
    }

    pub fn has_body_data(&self) -> bool {
        self.body_kind().is_some_and(|k| k.has_data())
    }

    /// Bytes of an encapsulated request head that precede the response
    /// head, which we do not need.
    pub fn skip_before_res_hdr(&self) -> usize {
        match (self.req_hdr, self.res_hdr) {
            (Some(req), Some(res)) => res - req,
            _ => 0,
        }
    }
}

/// Builder of the request side `Encapsulated` header and the heads it
/// points to.
#[derive(Default)]
pub(crate) struct EncapsulatedWriter {
    sections: Vec<(&'static str, usize)>,
    heads: Vec<u8>,
}

impl EncapsulatedWriter {
    pub(crate) fn add_head(&mut self, name: &'static str, head: &[u8]) {
        self.sections.push((name, self.heads.len()));
        self.heads.extend_from_slice(head);
    }

    pub(crate) fn set_body(&mut self, kind: IcapBodyKind) {
        self.sections.push((kind.as_str(), self.heads.len()));
    }

    pub(crate) fn write_header(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"Encapsulated: ");
        let mut itoa_buf = itoa::Buffer::new();
        for (i, (name, offset)) in self.sections.iter().enumerate() {
            if i > 0 {
                buf.extend_from_slice(b", ");
            }
            let _ = write!(buf, "{name}=");
            buf.extend_from_slice(itoa_buf.format(*offset).as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
    }

    pub(crate) fn into_heads(self) -> Vec<u8> {
        self.heads
    }
}
