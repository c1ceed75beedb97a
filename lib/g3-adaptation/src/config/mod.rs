/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use base64::prelude::*;
use http::HeaderName;
use url::Url;

#[cfg(feature = "yaml")]
pub mod yaml;

pub const DEFAULT_ICAP_PORT: u16 = 1344;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IcapMethod {
    Options,
    Reqmod,
    Respmod,
}

impl IcapMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            IcapMethod::Options => "OPTIONS",
            IcapMethod::Reqmod => "REQMOD",
            IcapMethod::Respmod => "RESPMOD",
        }
    }
}

impl fmt::Display for IcapMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IcapMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPTIONS" => Ok(IcapMethod::Options),
            "REQMOD" => Ok(IcapMethod::Reqmod),
            "RESPMOD" => Ok(IcapMethod::Respmod),
            _ => Err(()),
        }
    }
}

pub struct IcapServiceConfig {
    pub(crate) method: IcapMethod,
    url: Url,
    host: String,
    port: u16,
    basic_auth: Option<String>,
    user_agent: Option<String>,
    pub(crate) bypass: bool,
    pub(crate) icap_max_header_size: usize,
    pub(crate) preview_enable: bool,
    pub(crate) allow_204: bool,
    pub(crate) allow_206: bool,
    pub(crate) send_client_ip: bool,
    pub(crate) send_client_username: bool,
    pub(crate) client_username_header: HeaderName,
    pub(crate) client_username_encode: bool,
    pub(crate) reuse_connections: bool,
    pub(crate) max_connections: Option<usize>,
    pub(crate) connect_timeout: Duration,
    pub(crate) io_timeout: Duration,
    pub(crate) service_failure_limit: Option<usize>,
    pub(crate) oldest_service_failure: Duration,
    pub(crate) service_revival_delay: Duration,
    pub(crate) default_options_ttl: Duration,
}

impl IcapServiceConfig {
    pub fn new(method: IcapMethod, mut url: Url) -> anyhow::Result<Self> {
        if method == IcapMethod::Options {
            return Err(anyhow!("OPTIONS is not a valid service method"));
        }
        if url.scheme() != "icap" {
            return Err(anyhow!("unsupported url scheme {}", url.scheme()));
        }
        if !url.has_authority() {
            return Err(anyhow!("no authority part found in this url"));
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("no host found in this url"))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_ICAP_PORT);

        let basic_auth = if url.username().is_empty() {
            None
        } else {
            let password = url.password().unwrap_or_default();
            let raw = format!("{}:{password}", url.username());
            Some(BASE64_STANDARD.encode(raw))
        };
        url.set_username("")
            .map_err(|_| anyhow!("failed to clear username in url"))?;
        url.set_password(None)
            .map_err(|_| anyhow!("failed to clear password in url"))?;

        Ok(IcapServiceConfig {
            method,
            url,
            host,
            port,
            basic_auth,
            user_agent: None,
            bypass: false,
            icap_max_header_size: 8192,
            preview_enable: true,
            allow_204: true,
            allow_206: true,
            send_client_ip: false,
            send_client_username: false,
            client_username_header: HeaderName::from_static("x-client-username"),
            client_username_encode: false,
            reuse_connections: true,
            max_connections: None,
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(300),
            service_failure_limit: Some(10),
            oldest_service_failure: Duration::ZERO,
            service_revival_delay: Duration::from_secs(180),
            default_options_ttl: Duration::from_secs(60),
        })
    }

    #[inline]
    pub fn method(&self) -> IcapMethod {
        self.method
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn bypass(&self) -> bool {
        self.bypass
    }

    pub fn set_user_agent(&mut self, user_agent: &str) {
        self.user_agent = Some(user_agent.to_string());
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    pub fn set_icap_max_header_size(&mut self, max_size: usize) {
        self.icap_max_header_size = max_size;
    }

    pub fn set_preview_enable(&mut self, enable: bool) {
        self.preview_enable = enable;
    }

    pub fn set_allow_204(&mut self, allow: bool) {
        self.allow_204 = allow;
    }

    pub fn set_allow_206(&mut self, allow: bool) {
        self.allow_206 = allow;
    }

    pub fn set_send_client_ip(&mut self, send: bool) {
        self.send_client_ip = send;
    }

    pub fn set_send_client_username(&mut self, send: bool) {
        self.send_client_username = send;
    }

    pub fn set_client_username_header(&mut self, name: HeaderName) {
        self.client_username_header = name;
    }

    pub fn set_client_username_encode(&mut self, encode: bool) {
        self.client_username_encode = encode;
    }

    pub fn set_reuse_connections(&mut self, reuse: bool) {
        self.reuse_connections = reuse;
    }

    pub fn set_max_connections(&mut self, max: usize) {
        self.max_connections = Some(max);
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }

    /// `None` disables suspension on failures.
    pub fn set_service_failure_limit(&mut self, limit: Option<usize>) {
        self.service_failure_limit = limit;
    }

    /// Failures older than this are forgotten. Zero remembers them all.
    pub fn set_oldest_service_failure(&mut self, age: Duration) {
        self.oldest_service_failure = age;
    }

    pub fn set_service_revival_delay(&mut self, delay: Duration) {
        self.service_revival_delay = delay;
    }

    pub fn set_default_options_ttl(&mut self, ttl: Duration) {
        self.default_options_ttl = ttl;
    }

    /// Request line and the header fields every request to this service
    /// carries.
    pub(crate) fn write_common_header(&self, buf: &mut Vec<u8>, method: IcapMethod) {
        let _ = write!(buf, "{method} {} ICAP/1.0\r\n", self.url);
        let _ = write!(buf, "Host: {}:{}\r\n", self.host, self.port);
        if let Some(user_agent) = &self.user_agent {
            let _ = write!(buf, "User-Agent: {user_agent}\r\n");
        }
        if let Some(auth) = &self.basic_auth {
            let _ = write!(buf, "Authorization: Basic {auth}\r\n");
        }
    }
}
