/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io::Write;
use std::net::IpAddr;

use base64::prelude::*;
use bytes::BufMut;
use chrono::Utc;
use http::HeaderName;

pub(crate) fn add_date(buf: &mut Vec<u8>) {
    let _ = write!(
        buf,
        "Date: {}\r\n",
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
    );
}

pub(crate) fn add_client_addr(buf: &mut Vec<u8>, ip: IpAddr) {
    let _ = write!(buf, "X-Client-IP: {ip}\r\n");
}

pub(crate) fn add_client_username(buf: &mut Vec<u8>, name: &HeaderName, user: &str, encode: bool) {
    buf.put_slice(name.as_str().as_bytes());
    buf.put_slice(b": ");
    if encode {
        let v = BASE64_STANDARD.encode(user);
        buf.put_slice(v.as_bytes());
    } else {
        buf.put_slice(user.as_bytes());
    }
    buf.put_slice(b"\r\n");
}
