// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Handle thread pool (§4.7.3): one or more workers draining an adapter's
//! bounded request queue, applying the queue timeout, and dispatching into
//! the bound servant.
//!
//! A handle group may span multiple adapters in the general case (§3), but
//! each adapter owns exactly one queue, so the group is modeled here as a
//! pool of tasks bound to a single [`AdapterRuntime`] at a time; `Server`
//! (§4.7) spawns one group per adapter and keys them by `handle_group_name`
//! only for admin-surface reporting, not shared scheduling.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Instant,
};

use bytes::Bytes;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::warn;

use crate::server::{adapter::AdapterRuntime, protocol::frame, servant::ServantError};

/// `opencoroutine` policy for a server process (§4.7.3, §6 `coroutinememsize`/
/// `coroutinestack`). When disabled, each handle thread processes one
/// request at a time, exactly as a blocking OS thread would. When enabled,
/// each handle thread instead spawns a bounded pool of lightweight tasks —
/// the translation of "coroutine per accepted request" (§9) — sized to
/// `coroutine_mem_size / coroutine_stack_size`, so the handle thread keeps
/// pulling requests off the queue without waiting for earlier ones to
/// finish suspending on an outbound RPC.
#[derive(Debug, Clone, Copy)]
pub struct CoroutinePolicy {
    pub enabled: bool,
    pub pool_size: usize,
}

impl CoroutinePolicy {
    pub fn from_config(config: &crate::cfg::server_config::ServerConfig) -> Self {
        let pool_size = if config.coroutine_stack_size == 0 {
            1
        } else {
            (config.coroutine_mem_size / config.coroutine_stack_size).max(1) as usize
        };
        Self { enabled: config.opencoroutine, pool_size }
    }

    fn disabled() -> Self {
        Self { enabled: false, pool_size: 1 }
    }
}

/// Spawns `handle_count` (at least 1) tokio tasks that drain `adapter`'s
/// request queue until it closes. Each task independently locks the shared
/// receiver only for the instant it takes the next item, then drops the
/// lock before awaiting the servant, so multiple handle "threads" process
/// requests concurrently exactly as distinct OS threads would.
pub fn spawn(adapter: Arc<AdapterRuntime>, policy: CoroutinePolicy) -> Vec<JoinHandle<()>> {
    let count = adapter.config.handle_count.max(1);
    let receiver = Arc::new(tokio::sync::Mutex::new(None));
    let coroutine_pool =
        policy.enabled.then(|| Arc::new(Semaphore::new(policy.pool_size)));
    let mut handles = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let adapter = Arc::clone(&adapter);
        let receiver = Arc::clone(&receiver);
        let coroutine_pool = coroutine_pool.clone();
        handles.push(tokio::spawn(async move {
            // Lazily take the adapter's receiver exactly once across the
            // whole group, shared by every worker task thereafter.
            {
                let mut slot = receiver.lock().await;
                if slot.is_none() {
                    *slot = adapter.take_receiver().await;
                }
            }
            loop {
                let next = {
                    let mut slot = receiver.lock().await;
                    match slot.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => None,
                    }
                };
                let Some(req) = next else { break };

                match &coroutine_pool {
                    // Coroutine model: acquire a pool slot (may suspend the
                    // handle thread briefly if the pool is saturated), then
                    // hand the request to its own task so the thread can go
                    // back to the queue immediately — the task itself
                    // "yields" at its only suspension point, the servant's
                    // outbound-RPC awaits (§5).
                    Some(pool) => {
                        let pool = Arc::clone(pool);
                        let adapter = Arc::clone(&adapter);
                        tokio::spawn(async move {
                            let Ok(_permit) = pool.acquire_owned().await else { return };
                            handle_one(&adapter, req).await;
                        });
                    },
                    None => handle_one(&adapter, req).await,
                }
            }
        }));
    }
    handles
}

async fn handle_one(adapter: &AdapterRuntime, req: crate::server::adapter::QueuedRequest) {
    let queue_timeout = adapter.config.queue_timeout;
    if Instant::now().saturating_duration_since(req.arrival) > queue_timeout {
        adapter.timeout_count.fetch_add(1, Ordering::Relaxed);
        warn!(adapter = %adapter.config.name, "dropped request past queue_timeout");
        return;
    }

    let reply = match (adapter.servant)(req.connection_uid, req.payload).await {
        Ok(bytes) => bytes,
        Err(ServantError::HandlerPanicked(msg)) => {
            warn!(adapter = %adapter.config.name, %msg, "handler exception, converting to error response");
            error_response(&msg)
        },
        Err(ServantError::Application(msg)) => error_response(&msg),
    };

    let limit = adapter.config.back_packet_buffer_limit;
    if adapter.connections.send(req.connection_uid, frame(&reply), limit).is_err() {
        warn!(
            adapter = %adapter.config.name,
            conn = req.connection_uid,
            "reply dropped: connection gone or back-pressure limit exceeded"
        );
    }
}

fn error_response(msg: &str) -> Bytes {
    Bytes::from(format!("ERROR: {msg}"))
}
