// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side configuration (§6): `/tars/application/client`.

use std::time::Duration;

use thiserror::Error;

use crate::cfg::config::{ConfigDomain, ConfigError};

#[derive(Debug, Error)]
pub enum ClientConfigError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn get(domain: &ConfigDomain, key: &str, default: &str) -> String {
    domain.params.get(key).cloned().unwrap_or_else(|| default.to_string())
}

fn get_u64(domain: &ConfigDomain, key: &str, default: u64) -> u64 {
    domain.params.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Process-wide client (communicator) configuration snapshot (§4.8.1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub locator: String,
    pub sync_invoke_timeout: Duration,
    pub async_invoke_timeout: Duration,
    pub refresh_endpoint_interval: Duration,
    pub stat: String,
    pub property: String,
    pub report_interval: Duration,
    pub report_timeout: Duration,
    pub sample_rate: u32,
    pub max_sample_count: u32,
    pub max_report_size: usize,
    pub netthread: u32,
    pub asyncthread: u32,
    pub modulename: String,
}

impl ClientConfig {
    pub fn from_domain(root: &ConfigDomain) -> Result<Self, ClientConfigError> {
        let client = root.get_domain("/tars/application/client")?;

        let netthread = (get_u64(client, "netthread", 1) as u32).clamp(1, 64);
        let asyncthread = get_u64(client, "asyncthread", netthread as u64) as u32;

        let sync_invoke_timeout =
            Duration::from_millis(get_u64(client, "sync-invoke-timeout", 3000).max(1));
        let async_invoke_timeout =
            Duration::from_millis(get_u64(client, "async-invoke-timeout", 3000).max(1));

        Ok(ClientConfig {
            locator: get(client, "locator", ""),
            sync_invoke_timeout,
            async_invoke_timeout,
            refresh_endpoint_interval: Duration::from_millis(get_u64(
                client,
                "refresh-endpoint-interval",
                60_000,
            )),
            stat: get(client, "stat", ""),
            property: get(client, "property", ""),
            report_interval: Duration::from_millis(get_u64(client, "report-interval", 60_000)),
            report_timeout: Duration::from_millis(get_u64(client, "report-timeout", 5000)),
            sample_rate: get_u64(client, "sample-rate", 1000) as u32,
            max_sample_count: get_u64(client, "max-sample-count", 100) as u32,
            max_report_size: get_u64(client, "max-report-size", 1400) as usize,
            netthread,
            asyncthread,
            modulename: get(client, "modulename", ""),
        })
    }
}
