// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The client-side communicator (§4.8.1): owns the configuration snapshot,
//! the fixed array of network threads, and the async-response worker pool.
//!
//! There is deliberately no process-wide singleton here (§9 "singletons
//! with destroy-on-exit ... re-architect as explicit top-level objects
//! created by the bootstrap"); [`Communicator::new`] is called once from
//! the bootstrap binary and the resulting `Arc<Communicator>` is threaded
//! through to whatever owns outbound calls. [`crate::sync::singleton`] is
//! still used where the source genuinely needs a keyed factory cache
//! (a communicator instance per configuration name), via
//! [`CommunicatorFactory`].

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::{client_config::ClientConfig, enums::RoutingMode},
    client::{
        async_worker::{AsyncWorkerPool, Callback},
        endpoint::Locator,
        network_thread::{self, NetworkThreadHandle},
        request::{InvokeResult, RequestFlags},
        set_division::SetDivision,
    },
};

/// Owns every network thread and the async-response worker pool for one
/// loaded [`ClientConfig`] (§4.8.1).
pub struct Communicator {
    pub config: ClientConfig,
    net_threads: Vec<NetworkThreadHandle>,
    async_workers: AsyncWorkerPool,
    cancel: CancellationToken,
}

impl Communicator {
    pub fn new(config: ClientConfig, locator: Arc<dyn Locator>, routing: RoutingMode) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let net_threads = (0..config.netthread.max(1))
            .map(|_| {
                network_thread::spawn(
                    Arc::clone(&locator),
                    routing,
                    config.refresh_endpoint_interval,
                    config.async_invoke_timeout,
                    cancel.clone(),
                )
            })
            .collect();
        let async_workers = AsyncWorkerPool::spawn(config.asyncthread.max(1), cancel.clone());
        Arc::new(Self { config, net_threads, async_workers, cancel })
    }

    /// Shards `servant_name` onto one of this communicator's network
    /// threads (§4.8.2: "object proxies sharded by hash of object name").
    /// The same name always resolves to the same thread, which is what
    /// lets each object proxy live on exactly one thread for its whole
    /// lifetime.
    fn thread_for(&self, servant_name: &str) -> &NetworkThreadHandle {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        servant_name.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.net_threads.len();
        &self.net_threads[idx]
    }

    /// Synchronous-style invocation: awaits the response inline on the
    /// caller's task (§4.8's "per-network-thread object proxy" still
    /// serializes the actual work onto its owning thread; this just awaits
    /// that thread's answer instead of handing it to a callback).
    pub async fn invoke(
        &self,
        servant_name: &str,
        set_division: SetDivision,
        method: &str,
        payload: Bytes,
        routing_tag: Option<String>,
    ) -> anyhow::Result<InvokeResult> {
        let handle = self.thread_for(servant_name);
        let rx = handle
            .invoke(
                servant_name,
                set_division,
                method,
                payload,
                RequestFlags::empty(),
                routing_tag,
                None,
                self.config.sync_invoke_timeout,
            )
            .await?;
        Ok(rx.await.unwrap_or(InvokeResult::Timeout))
    }

    /// Asynchronous invocation (§4.8.4): submits the call and dispatches
    /// `callback` onto the async-worker pool once it resolves, without
    /// blocking the caller.
    pub async fn invoke_async(
        &self,
        servant_name: &str,
        set_division: SetDivision,
        method: &str,
        payload: Bytes,
        routing_tag: Option<String>,
        callback: Callback,
    ) -> anyhow::Result<()> {
        let handle = self.thread_for(servant_name);
        let rx = handle
            .invoke(
                servant_name,
                set_division,
                method,
                payload,
                RequestFlags::empty(),
                routing_tag,
                None,
                self.config.async_invoke_timeout,
            )
            .await?;
        self.async_workers.dispatch(rx, callback);
        Ok(())
    }

    pub fn async_worker_count(&self) -> usize {
        self.async_workers.worker_count()
    }

    /// Signals every network thread and async worker to stop. Matches the
    /// server's `terminate()` shutdown ordering (§5) on the client side.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Memoizes communicator instances by configuration name (§4.8.1's
/// "created by a factory keyed by name"), the one piece of process-wide
/// shared state the client core genuinely needs — everything else is
/// threaded through explicitly rather than reached for as a global.
#[derive(Default)]
pub struct CommunicatorFactory {
    instances: Mutex<HashMap<String, Arc<Communicator>>>,
}

impl CommunicatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        name: &str,
        build: impl FnOnce() -> Arc<Communicator>,
    ) -> Arc<Communicator> {
        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(name) {
            return Arc::clone(existing);
        }
        let created = build();
        instances.insert(name.to_string(), Arc::clone(&created));
        created
    }
}
