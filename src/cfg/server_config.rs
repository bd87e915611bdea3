// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-side configuration (§6): `/tars/application/server` and its
//! per-adapter child sections.

use std::time::Duration;

use thiserror::Error;

use crate::cfg::{
    config::{ConfigDomain, ConfigError},
    enums::{AclOrder, Transport},
};

#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("adapter {adapter:?}: servant {servant:?} does not start with server prefix {prefix:?}")]
    ServantPrefixMismatch { adapter: String, servant: String, prefix: String },
    #[error("adapter {adapter:?}: invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { adapter: String, endpoint: String, reason: String },
    #[error("netthread {0} out of range 1..=15")]
    NetThreadOutOfRange(u32),
}

fn get(domain: &ConfigDomain, key: &str, default: &str) -> String {
    domain.params.get(key).cloned().unwrap_or_else(|| default.to_string())
}

fn get_u64(domain: &ConfigDomain, key: &str, default: u64) -> u64 {
    domain.params.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_bool(domain: &ConfigDomain, key: &str, default: bool) -> bool {
    domain
        .params
        .get(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Parsed `tcp|udp -h <ip> -p <port> -t <ms>` endpoint string.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut toks = s.split_whitespace();
        let transport: Transport = toks
            .next()
            .ok_or("missing transport")?
            .parse()
            .map_err(|e: anyhow::Error| e.to_string())?;
        let mut host = None;
        let mut port = None;
        let mut timeout_ms = 3000u64;
        while let Some(flag) = toks.next() {
            let value = toks.next().ok_or_else(|| format!("flag {flag} missing value"))?;
            match flag {
                "-h" => host = Some(value.to_string()),
                "-p" => port = Some(value.parse::<u16>().map_err(|e| e.to_string())?),
                "-t" => timeout_ms = value.parse::<u64>().map_err(|e| e.to_string())?,
                other => return Err(format!("unknown endpoint flag {other}")),
            }
        }
        Ok(Endpoint {
            transport,
            host: host.ok_or("missing -h host")?,
            port: port.ok_or("missing -p port")?,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A single `servant`-bearing child section of `/tars/application/server`
/// (§3's `BindAdapter`).
#[derive(Debug, Clone)]
pub struct BindAdapter {
    pub name: String,
    pub servant: String,
    pub endpoint: Endpoint,
    pub max_conns: u32,
    pub queue_capacity: usize,
    pub queue_timeout: Duration,
    pub protocol_name: String,
    pub handle_group_name: String,
    pub handle_count: u32,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    pub order: AclOrder,
    pub back_packet_buffer_limit: usize,
    pub ak: Option<String>,
    pub sk: Option<String>,
}

impl BindAdapter {
    fn from_domain(
        name: &str,
        domain: &ConfigDomain,
        app_server_prefix: &str,
    ) -> Result<Self, ServerConfigError> {
        let servant = domain
            .params
            .get("servant")
            .cloned()
            .ok_or_else(|| ServerConfigError::Config(ConfigError::NoSuchParameter {
                path: format!("/{name}<servant>"),
            }))?;
        if !servant.starts_with(app_server_prefix) {
            return Err(ServerConfigError::ServantPrefixMismatch {
                adapter: name.to_string(),
                servant,
                prefix: app_server_prefix.to_string(),
            });
        }

        let endpoint_str = get(domain, "endpoint", "");
        let endpoint = Endpoint::parse(&endpoint_str).map_err(|reason| {
            ServerConfigError::InvalidEndpoint {
                adapter: name.to_string(),
                endpoint: endpoint_str.clone(),
                reason,
            }
        })?;

        let order: AclOrder =
            get(domain, "order", "allow,deny").parse().unwrap_or_default();
        let split_list = |raw: &str| -> Vec<String> {
            raw.split(|c: char| c == ',' || c.is_whitespace())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        Ok(BindAdapter {
            name: name.to_string(),
            servant,
            endpoint,
            max_conns: get_u64(domain, "maxconns", 128) as u32,
            queue_capacity: get_u64(domain, "queuecap", 1024) as usize,
            queue_timeout: Duration::from_millis(get_u64(domain, "queuetimeout", 10_000)),
            protocol_name: get(domain, "protocol", "tars"),
            handle_group_name: get(domain, "handlegroup", name),
            handle_count: get_u64(domain, "threads", 0) as u32,
            allow_list: split_list(&get(domain, "allow", "")),
            deny_list: split_list(&get(domain, "deny", "")),
            order,
            back_packet_buffer_limit: get_u64(domain, "BackPacketBuffLimit", 0) as usize,
            ak: domain.params.get("accesskey").cloned(),
            sk: domain.params.get("secretkey").cloned(),
        })
    }
}

/// Process-wide server configuration snapshot (§3 `ServerConfig`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub app: String,
    pub server: String,
    pub localip: String,
    pub basepath: String,
    pub datapath: String,
    pub logpath: String,
    pub logsize: u64,
    pub lognum: u32,
    pub local: Option<Endpoint>,
    pub log_level: String,
    pub netthread: u32,
    pub opencoroutine: bool,
    pub coroutine_mem_size: u64,
    pub coroutine_stack_size: u64,
    pub close_cout: bool,
    pub logstatreport: bool,
    pub empty_con_check: bool,
    pub empty_conn_timeout: Duration,
    pub reportflow: bool,
    pub checkset: bool,
    pub pool_min_block_size: usize,
    pub pool_max_block_size: usize,
    pub pool_max_bytes: usize,
    pub back_packet_buffer_limit: usize,
    pub adapters: Vec<BindAdapter>,
}

fn detect_local_ip() -> String {
    // Best-effort: a real bootstrap would enumerate interfaces and pick the
    // first non-loopback address; tests and most deployments set `localip`
    // explicitly, so this is a documented fallback, not a network probe.
    "127.0.0.1".to_string()
}

impl ServerConfig {
    /// Loads a [`ServerConfig`] from the `/tars/application/server` domain
    /// of a parsed configuration tree, applying every default in §6's
    /// bracketed table. Every child section bearing a `servant` key is
    /// treated as a [`BindAdapter`]; an "admin" adapter is synthesized when
    /// `local` names an endpoint (§4.7.1).
    pub fn from_domain(root: &ConfigDomain) -> Result<Self, ServerConfigError> {
        let server = root.get_domain("/tars/application/server")?;

        let app = get(server, "app", "");
        let server_name = get(server, "server", "");
        let prefix = format!("{app}.{server_name}.");

        let netthread = (get_u64(server, "netthread", 1) as u32).clamp(1, 15);

        let mut adapters = Vec::new();
        for child in server.children() {
            if !child.params.contains_key("servant") {
                continue;
            }
            adapters.push(BindAdapter::from_domain(&child.name, child, &prefix)?);
        }

        let local = match server.params.get("local") {
            Some(ep) if !ep.is_empty() => Some(Endpoint::parse(ep).map_err(|reason| {
                ServerConfigError::InvalidEndpoint {
                    adapter: "admin".to_string(),
                    endpoint: ep.clone(),
                    reason,
                }
            })?),
            _ => None,
        };
        if let Some(admin_endpoint) = local.clone() {
            adapters.push(BindAdapter {
                name: "admin".to_string(),
                servant: format!("{app}.{server_name}.AdminObj"),
                endpoint: admin_endpoint,
                max_conns: 8,
                queue_capacity: 64,
                queue_timeout: Duration::from_millis(10_000),
                protocol_name: "tars".to_string(),
                handle_group_name: "admin".to_string(),
                handle_count: 1,
                allow_list: Vec::new(),
                deny_list: Vec::new(),
                order: AclOrder::AllowDeny,
                back_packet_buffer_limit: 0,
                ak: None,
                sk: None,
            });
        }

        Ok(ServerConfig {
            app,
            server: server_name,
            localip: {
                let v = get(server, "localip", "");
                if v.is_empty() { detect_local_ip() } else { v }
            },
            basepath: get(server, "basepath", "."),
            datapath: get(server, "datapath", "."),
            logpath: get(server, "logpath", "."),
            logsize: get_u64(server, "logsize", 50 * 1024 * 1024),
            lognum: get_u64(server, "lognum", 10) as u32,
            local,
            log_level: get(server, "log", "INFO"),
            netthread,
            opencoroutine: get_bool(server, "opencoroutine", false),
            coroutine_mem_size: get_u64(server, "coroutinememsize", 1024 * 1024 * 1024),
            coroutine_stack_size: get_u64(server, "coroutinestack", 128 * 1024),
            close_cout: get_bool(server, "closecout", true),
            logstatreport: get_bool(server, "logstatreport", false),
            empty_con_check: get_bool(server, "emptyconcheck", false),
            empty_conn_timeout: Duration::from_secs(get_u64(server, "emptyconntimeout", 3)),
            reportflow: get_bool(server, "reportflow", true),
            checkset: get_bool(server, "checkset", true),
            pool_min_block_size: get_u64(server, "poolminblocksize", 1024) as usize,
            pool_max_block_size: get_u64(server, "poolmaxblocksize", 8 * 1024 * 1024) as usize,
            pool_max_bytes: get_u64(server, "poolmaxbytes", 64 * 1024 * 1024) as usize,
            back_packet_buffer_limit: get_u64(server, "BackPacketBuffLimit", 0) as usize,
            adapters,
        })
    }
}
