/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use http::HeaderName;
use humanize_rs::ParseError;
use url::Url;
use yaml_rust::{Yaml, yaml};

use super::{IcapMethod, IcapServiceConfig};

fn normalize_key(raw: &str) -> String {
    raw.to_lowercase().replace('-', "_")
}

fn foreach_kv<F>(table: &yaml::Hash, mut f: F) -> anyhow::Result<()>
where
    F: FnMut(&str, &Yaml) -> anyhow::Result<()>,
{
    for (k, v) in table.iter() {
        if let Yaml::String(key) = k {
            f(key, v).context(format!("failed to parse value of key {key}"))?;
        } else {
            return Err(anyhow!("key in hash should be string"));
        }
    }
    Ok(())
}

fn as_bool(v: &Yaml) -> anyhow::Result<bool> {
    match v {
        Yaml::String(s) => match s.to_lowercase().as_str() {
            "on" | "true" | "yes" | "1" => Ok(true),
            "off" | "false" | "no" | "0" => Ok(false),
            _ => Err(anyhow!("invalid yaml string value for 'bool': {s}")),
        },
        Yaml::Boolean(value) => Ok(*value),
        Yaml::Integer(i) => Ok(*i != 0),
        _ => Err(anyhow!(
            "yaml value type for 'bool' should be 'boolean' / 'string' / 'integer'"
        )),
    }
}

fn as_usize(v: &Yaml) -> anyhow::Result<usize> {
    match v {
        Yaml::String(s) => Ok(usize::from_str(s)?),
        Yaml::Integer(i) => Ok(usize::try_from(*i)?),
        _ => Err(anyhow!(
            "yaml value type for 'usize' should be 'string' or 'integer'"
        )),
    }
}

fn as_string(v: &Yaml) -> anyhow::Result<String> {
    match v {
        Yaml::String(s) => Ok(s.to_string()),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Real(s) => Ok(s.to_string()),
        _ => Err(anyhow!(
            "yaml value type for string should be 'string' / 'integer' / 'real'"
        )),
    }
}

fn as_duration(v: &Yaml) -> anyhow::Result<Duration> {
    match v {
        Yaml::String(value) => match humanize_rs::duration::parse(value) {
            Ok(v) => Ok(v),
            Err(ParseError::MissingUnit) => {
                if let Ok(u) = u64::from_str(value) {
                    Ok(Duration::from_secs(u))
                } else if let Ok(f) = f64::from_str(value) {
                    Duration::try_from_secs_f64(f).map_err(anyhow::Error::new)
                } else {
                    Err(anyhow!("invalid duration string"))
                }
            }
            Err(e) => Err(anyhow!("invalid humanize duration string: {e}")),
        },
        Yaml::Integer(value) => {
            if let Ok(u) = u64::try_from(*value) {
                Ok(Duration::from_secs(u))
            } else {
                Err(anyhow!("unsupported duration string"))
            }
        }
        Yaml::Real(s) => {
            let f = f64::from_str(s).map_err(|e| anyhow!("invalid f64 value: {e}"))?;
            Duration::try_from_secs_f64(f).map_err(anyhow::Error::new)
        }
        _ => Err(anyhow!(
            "yaml value type for humanize duration should be 'string' or 'integer' or 'real'"
        )),
    }
}

/// A negative limit turns failure based suspension off.
fn as_failure_limit(v: &Yaml) -> anyhow::Result<Option<usize>> {
    match v {
        Yaml::Integer(i) if *i < 0 => Ok(None),
        Yaml::String(s) if s.starts_with('-') => Ok(None),
        _ => as_usize(v).map(Some),
    }
}

fn as_url(v: &Yaml) -> anyhow::Result<Url> {
    if let Yaml::String(s) = v {
        Url::parse(s).map_err(|e| anyhow!("invalid url string: {e}"))
    } else {
        Err(anyhow!("the yaml value type for 'url' should be 'string'"))
    }
}

fn set_config_value(config: &mut IcapServiceConfig, k: &str, v: &Yaml) -> anyhow::Result<()> {
    match normalize_key(k).as_str() {
        "url" => Ok(()),
        "bypass" => {
            let bypass = as_bool(v)?;
            config.set_bypass(bypass);
            Ok(())
        }
        "icap_max_header_size" => {
            let size = as_usize(v)?;
            config.set_icap_max_header_size(size);
            Ok(())
        }
        "preview" | "preview_enable" => {
            let enable = as_bool(v)?;
            config.set_preview_enable(enable);
            Ok(())
        }
        "allow_204" => {
            let allow = as_bool(v)?;
            config.set_allow_204(allow);
            Ok(())
        }
        "allow_206" => {
            let allow = as_bool(v)?;
            config.set_allow_206(allow);
            Ok(())
        }
        "send_client_ip" => {
            let send = as_bool(v)?;
            config.set_send_client_ip(send);
            Ok(())
        }
        "send_client_username" => {
            let send = as_bool(v)?;
            config.set_send_client_username(send);
            Ok(())
        }
        "client_username_header" => {
            let name = as_string(v)?;
            let name = HeaderName::from_str(&name)
                .map_err(|e| anyhow!("invalid header name {name}: {e}"))?;
            config.set_client_username_header(name);
            Ok(())
        }
        "client_username_encode" => {
            let encode = as_bool(v)?;
            config.set_client_username_encode(encode);
            Ok(())
        }
        "reuse_connections" => {
            let reuse = as_bool(v)?;
            config.set_reuse_connections(reuse);
            Ok(())
        }
        "max_connections" => {
            let max = as_usize(v)?;
            config.set_max_connections(max);
            Ok(())
        }
        "connect_timeout" => {
            let timeout = as_duration(v)?;
            config.set_connect_timeout(timeout);
            Ok(())
        }
        "io_timeout" => {
            let timeout = as_duration(v)?;
            config.set_io_timeout(timeout);
            Ok(())
        }
        "service_failure_limit" => {
            let limit = as_failure_limit(v)?;
            config.set_service_failure_limit(limit);
            Ok(())
        }
        "oldest_service_failure" => {
            let age = as_duration(v)?;
            config.set_oldest_service_failure(age);
            Ok(())
        }
        "service_revival_delay" => {
            let delay = as_duration(v)?;
            config.set_service_revival_delay(delay);
            Ok(())
        }
        "default_options_ttl" => {
            let ttl = as_duration(v)?;
            config.set_default_options_ttl(ttl);
            Ok(())
        }
        "user_agent" => {
            let ua = as_string(v)?;
            config.set_user_agent(&ua);
            Ok(())
        }
        _ => Err(anyhow!("invalid key {k}")),
    }
}

/// Parse an ICAP service entry: either a plain url string, or a map with a
/// `url` key and optional tuning keys.
pub fn as_icap_service_config(v: &Yaml, method: IcapMethod) -> anyhow::Result<IcapServiceConfig> {
    match v {
        Yaml::Hash(map) => {
            let url = map
                .iter()
                .find(|(k, _)| matches!(k, Yaml::String(s) if normalize_key(s) == "url"))
                .map(|(_, v)| v)
                .ok_or_else(|| anyhow!("no url set"))?;
            let url = as_url(url).context("invalid value for key url")?;
            let mut config = IcapServiceConfig::new(method, url)?;
            foreach_kv(map, |k, v| set_config_value(&mut config, k, v))?;
            Ok(config)
        }
        Yaml::String(_) => {
            let url = as_url(v)?;
            IcapServiceConfig::new(method, url)
        }
        _ => Err(anyhow!(
            "yaml value type for 'icap service config' should be 'map' or 'string'"
        )),
    }
}
