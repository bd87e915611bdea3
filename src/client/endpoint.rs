// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Object-proxy endpoint sets (§4.8.3).
//!
//! Each [`crate::client::object_proxy::ObjectProxy`] owns one
//! [`EndpointSet`]: endpoints start active, move to inactive on connection
//! refusal or repeated timeout, and a probe promotes them back. The locator
//! (GLOSSARY) that supplies the endpoint list in the first place is an
//! external collaborator (§1 Non-goals); [`Locator`] is the trait this crate
//! calls through, with [`StaticLocator`] as the in-process stand-in used by
//! tests and by `static` routing mode.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;

/// Failure-tracking state for one endpoint.
#[derive(Debug, Clone)]
struct EndpointState {
    addr: SocketAddr,
    active: bool,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// How many consecutive connect-refused/timeout failures demote an
/// endpoint to inactive (§4.8.3).
const FAILURE_THRESHOLD: u32 = 3;
/// How long an inactive endpoint waits before it is eligible to be probed
/// again.
const PROBE_BACKOFF: Duration = Duration::from_secs(5);

/// The active/inactive endpoint set for one object proxy.
#[derive(Debug, Default)]
pub struct EndpointSet {
    endpoints: HashMap<SocketAddr, EndpointState>,
    /// Preserves the order endpoints were last supplied in, so round-robin
    /// and consistent-hash node indices stay stable between refreshes that
    /// don't actually change membership.
    order: Vec<SocketAddr>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the full endpoint membership from a locator refresh (§4.8.3
    /// "refreshed from the locator on a cadence"). Endpoints present in
    /// both the old and new set keep their active/inactive state and
    /// failure counters; genuinely new endpoints start active.
    pub fn refresh(&mut self, addrs: &[SocketAddr]) {
        let mut next = HashMap::with_capacity(addrs.len());
        let mut order = Vec::with_capacity(addrs.len());
        for &addr in addrs {
            let state = self.endpoints.remove(&addr).unwrap_or(EndpointState {
                addr,
                active: true,
                consecutive_failures: 0,
                last_failure: None,
            });
            order.push(addr);
            next.insert(addr, state);
        }
        self.endpoints = next;
        self.order = order;
    }

    pub fn active(&self) -> Vec<SocketAddr> {
        self.order.iter().copied().filter(|a| self.endpoints[a].active).collect()
    }

    pub fn all(&self) -> &[SocketAddr] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Records a connect-refused or timeout failure against `addr`.
    /// Demotes it to inactive once [`FAILURE_THRESHOLD`] consecutive
    /// failures have accumulated (§4.8.3).
    pub fn report_failure(&mut self, addr: SocketAddr) {
        let Some(state) = self.endpoints.get_mut(&addr) else { return };
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        if state.consecutive_failures >= FAILURE_THRESHOLD {
            state.active = false;
        }
    }

    /// Records a successful call against `addr`, promoting it back to
    /// active and resetting its failure counter.
    pub fn report_success(&mut self, addr: SocketAddr) {
        if let Some(state) = self.endpoints.get_mut(&addr) {
            state.consecutive_failures = 0;
            state.active = true;
        }
    }

    /// Inactive endpoints whose backoff has elapsed, eligible for a probe
    /// connection attempt this tick (§4.8.3 "a probe is scheduled").
    pub fn due_for_probe(&self) -> Vec<SocketAddr> {
        let now = Instant::now();
        self.endpoints
            .values()
            .filter(|s| {
                !s.active
                    && s.last_failure
                        .map(|t| now.saturating_duration_since(t) >= PROBE_BACKOFF)
                        .unwrap_or(true)
            })
            .map(|s| s.addr)
            .collect()
    }
}

/// Directory service that resolves a servant name (plus set division) to an
/// endpoint list (GLOSSARY "Locator"). Out of scope as a remote service
/// (§1); this is the interface the communicator calls through.
#[async_trait]
pub trait Locator: Send + Sync {
    async fn resolve(&self, servant_name: &str) -> anyhow::Result<Vec<SocketAddr>>;
}

/// A fixed, in-process endpoint table used by `static` routing mode and by
/// tests that don't stand up a real locator service.
#[derive(Debug, Default)]
pub struct StaticLocator {
    table: HashMap<String, Vec<SocketAddr>>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoints(mut self, servant_name: &str, addrs: Vec<SocketAddr>) -> Self {
        self.table.insert(servant_name.to_string(), addrs);
        self
    }
}

#[async_trait]
impl Locator for StaticLocator {
    async fn resolve(&self, servant_name: &str) -> anyhow::Result<Vec<SocketAddr>> {
        self.table
            .get(servant_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no static endpoints configured for {servant_name}"))
    }
}
