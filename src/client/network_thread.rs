// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One client network thread (§4.8.2): owns a shard of object proxies,
//! drives their locator refresh and timeout-sweep timers, and exposes a
//! handle other threads submit invocations through.
//!
//! §4.8.2 calls for a "wakeup-fd-backed inbox" so that invocations from
//! arbitrary user threads are routed to the proxy's owning thread without
//! the proxy needing internal locks. A tokio `mpsc` channel plays that role
//! here: the owning task is the only thing that ever touches a given
//! [`ObjectProxy`] by `&mut`, so endpoint-state mutation stays serialized
//! per proxy exactly as §5 requires, without an explicit mutex.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::enums::RoutingMode,
    client::{
        endpoint::Locator,
        object_proxy::ObjectProxy,
        request::{InvokeResult, RequestFlags},
        set_division::SetDivision,
    },
};

struct InvokeCommand {
    servant_name: String,
    set_division: SetDivision,
    method: String,
    payload: Bytes,
    flags: RequestFlags,
    routing_tag: Option<String>,
    dyeing_key: Option<String>,
    io_timeout: Duration,
    respond: oneshot::Sender<oneshot::Receiver<InvokeResult>>,
}

enum Command {
    Invoke(InvokeCommand),
}

/// A handle other threads use to submit work to one network thread's
/// owned proxies; cheap to clone and share.
#[derive(Clone)]
pub struct NetworkThreadHandle {
    inbox: mpsc::UnboundedSender<Command>,
}

impl NetworkThreadHandle {
    /// Submits one invocation to the proxy for `(servant_name,
    /// set_division)`, creating it on first use. Returns the receiver the
    /// caller (or an async-response worker) awaits for the outcome.
    pub async fn invoke(
        &self,
        servant_name: &str,
        set_division: SetDivision,
        method: &str,
        payload: Bytes,
        flags: RequestFlags,
        routing_tag: Option<String>,
        dyeing_key: Option<String>,
        io_timeout: Duration,
    ) -> anyhow::Result<oneshot::Receiver<InvokeResult>> {
        let (respond, ack) = oneshot::channel();
        self.inbox
            .send(Command::Invoke(InvokeCommand {
                servant_name: servant_name.to_string(),
                set_division,
                method: method.to_string(),
                payload,
                flags,
                routing_tag,
                dyeing_key,
                io_timeout,
                respond,
            }))
            .map_err(|_| anyhow::anyhow!("network thread has shut down"))?;
        ack.await.map_err(|_| anyhow::anyhow!("network thread dropped the invocation"))
    }
}

/// Spawns one network thread's task loop and returns a handle to it.
pub fn spawn(
    locator: Arc<dyn Locator>,
    routing: RoutingMode,
    refresh_interval: Duration,
    timeout_threshold: Duration,
    cancel: CancellationToken,
) -> NetworkThreadHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(rx, locator, routing, refresh_interval, timeout_threshold, cancel));
    NetworkThreadHandle { inbox: tx }
}

async fn run(
    mut inbox: mpsc::UnboundedReceiver<Command>,
    locator: Arc<dyn Locator>,
    routing: RoutingMode,
    refresh_interval: Duration,
    timeout_threshold: Duration,
    cancel: CancellationToken,
) {
    let mut proxies: HashMap<(String, SetDivision), ObjectProxy> = HashMap::new();
    let mut refresh_tick = tokio::time::interval(refresh_interval.max(Duration::from_millis(1)));
    let mut sweep_tick = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = refresh_tick.tick() => {
                for ((servant, _sd), proxy) in proxies.iter_mut() {
                    if let Ok(addrs) = locator.resolve(servant).await {
                        proxy.refresh_endpoints(&addrs);
                    }
                }
            }
            _ = sweep_tick.tick() => {
                for proxy in proxies.values() {
                    proxy.sweep_timeouts(timeout_threshold);
                }
            }
            cmd = inbox.recv() => {
                let Some(Command::Invoke(cmd)) = cmd else { break };
                let key = (cmd.servant_name.clone(), cmd.set_division.clone());
                let is_new = !proxies.contains_key(&key);
                let proxy = proxies
                    .entry(key)
                    .or_insert_with(|| ObjectProxy::new(cmd.servant_name.clone(), cmd.set_division.clone(), routing));
                if is_new && let Ok(addrs) = locator.resolve(&cmd.servant_name).await {
                    proxy.refresh_endpoints(&addrs);
                }
                let rx = proxy
                    .invoke(
                        &cmd.method,
                        cmd.payload,
                        cmd.flags,
                        cmd.routing_tag.as_deref(),
                        cmd.dyeing_key,
                        cmd.io_timeout,
                    )
                    .await;
                let _ = cmd.respond.send(rx);
            }
        }
    }
}
