// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Runtime state for one bound listen adapter (§3 `BindAdapter`, §4.7.1,
//! §4.7.4).
//!
//! [`crate::cfg::server_config::BindAdapter`] is the static configuration
//! snapshot; [`AdapterRuntime`] is the live state built from it once at
//! bootstrap: the connection table, the bounded inbound request queue
//! shared by the adapter's handle group, and the per-adapter counters the
//! admin surface and back-pressure policy read from (§4.7.4, §7 kind 5).

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    cfg::server_config::BindAdapter,
    server::{connection::ConnectionTable, protocol::ProtocolParser, servant::Servant},
};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter {0:?} queue is full (overload)")]
    QueueOverload(String),
}

/// One whole request, tagged with the connection it arrived on and the
/// time it was enqueued so the handle thread can apply the queue timeout
/// (§4.7.3).
#[derive(Debug)]
pub struct QueuedRequest {
    pub connection_uid: u32,
    pub payload: Bytes,
    pub arrival: Instant,
}

/// Live state for one adapter, built once from its [`BindAdapter`] at
/// bootstrap and shared between the net threads that feed it and the
/// handle threads that drain it.
pub struct AdapterRuntime {
    pub config: BindAdapter,
    pub connections: ConnectionTable,
    pub protocol: Arc<dyn ProtocolParser>,
    pub servant: Servant,
    queue_tx: mpsc::Sender<QueuedRequest>,
    queue_rx: tokio::sync::Mutex<Option<mpsc::Receiver<QueuedRequest>>>,
    pub overload_count: AtomicU64,
    pub timeout_count: AtomicU64,
    pub conn_rate: AtomicU64,
}

impl AdapterRuntime {
    pub fn new(config: BindAdapter, protocol: Arc<dyn ProtocolParser>, servant: Servant) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            connections: ConnectionTable::new(),
            protocol,
            servant,
            queue_tx: tx,
            queue_rx: tokio::sync::Mutex::new(Some(rx)),
            overload_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            conn_rate: AtomicU64::new(0),
        }
    }

    /// Enqueues a whole request. Fails with [`AdapterError::QueueOverload`]
    /// when the adapter's bounded queue is at `queue_capacity` (§4.7.4);
    /// the caller reports a server-overload status to the sender (§7 kind
    /// 5) and bumps [`Self::overload_count`].
    pub fn enqueue(&self, req: QueuedRequest) -> Result<(), AdapterError> {
        match self.queue_tx.try_send(req) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.overload_count.fetch_add(1, Ordering::Relaxed);
                Err(AdapterError::QueueOverload(self.config.name.clone()))
            },
        }
    }

    /// Takes ownership of the receiving half so a handle group can drain
    /// it. Only one handle group may own an adapter's queue at a time
    /// (§3's "one adapter belongs to exactly one handle group" invariant).
    pub async fn take_receiver(&self) -> Option<mpsc::Receiver<QueuedRequest>> {
        self.queue_rx.lock().await.take()
    }
}
