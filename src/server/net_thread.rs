// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Net thread: accepts connections for one adapter, frames inbound bytes,
//! enqueues whole requests, and writes queued replies back (§4.7.2).
//!
//! §4.7.2 describes a hand-rolled epoll loop driving every adapter's
//! accept socket plus a round-robined subset of established connections.
//! SPEC_FULL.md records the resolution: each "net thread" here is a tokio
//! task per connection (the runtime's own reactor is epoll-backed on
//! Linux), so the per-connection invariant ("no cross-thread socket
//! ownership") holds without hand-written `epoll_wait` calls. One
//! `accept_loop` per adapter plays the role of the net thread's accept
//! responsibility; each accepted connection gets its own read+write task
//! pair, which is where bytes are actually framed and queued.

use std::{net::IpAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::enums::Transport,
    server::{
        acl::is_allowed,
        adapter::{AdapterRuntime, QueuedRequest},
        connection::Connection,
    },
};

/// Binds and drives `adapter`'s accept loop until `cancel` fires. Returns
/// once the listener is closed and all spawned connection tasks have been
/// told to stop (graceful `terminate()`, §5).
/// Empty-connection-attack defense settings (§4.7.2, §6 `emptyconcheck`/
/// `emptyconntimeout`): connections that never produce a complete request
/// within `timeout` are closed when `enabled`.
#[derive(Debug, Clone, Copy)]
pub struct EmptyConnPolicy {
    pub enabled: bool,
    pub timeout: Duration,
}

pub async fn run(adapter: Arc<AdapterRuntime>, empty_conn: EmptyConnPolicy, cancel: CancellationToken) {
    match adapter.config.endpoint.transport {
        Transport::Tcp => run_tcp(adapter, empty_conn, cancel).await,
        Transport::Udp => run_udp(adapter, cancel).await,
    }
}

async fn run_tcp(adapter: Arc<AdapterRuntime>, empty_conn: EmptyConnPolicy, cancel: CancellationToken) {
    let addr = adapter.config.endpoint.socket_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(adapter = %adapter.config.name, %addr, error = %e, "bind failed");
            return;
        },
    };
    debug!(adapter = %adapter.config.name, %addr, "listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                if adapter.connections.len() >= adapter.config.max_conns as usize {
                    drop(stream);
                    continue;
                }
                if !is_allowed(&adapter.config, &peer.ip()) {
                    drop(stream);
                    continue;
                }
                adapter.conn_rate.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let adapter = Arc::clone(&adapter);
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    serve_connection(adapter, stream, peer.ip(), peer.port(), empty_conn, cancel).await;
                });
            }
        }
    }
}

async fn serve_connection(
    adapter: Arc<AdapterRuntime>,
    mut stream: TcpStream,
    ip: IpAddr,
    port: u16,
    empty_conn: EmptyConnPolicy,
    cancel: CancellationToken,
) {
    let (conn, mut outbound_rx) = Connection::new(ip, port, adapter.config.endpoint.timeout);
    let uid = adapter.connections.insert(conn);

    let mut scratch = BytesMut::with_capacity(4096);
    let mut read_buf = [0u8; 4096];
    let empty_con_deadline = tokio::time::Instant::now() + empty_conn.timeout;
    let mut saw_complete_request = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outgoing = outbound_rx.recv() => {
                let Some(bytes) = outgoing else { break };
                let len = bytes.len();
                if stream.write_all(&bytes).await.is_err() {
                    break;
                }
                adapter.connections.ack_flushed(uid, len);
            }
            n = stream.read(&mut read_buf) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        scratch.extend_from_slice(&read_buf[..n]);
                        adapter.connections.touch(uid);
                        let frames = match adapter.protocol.parse_all(&mut scratch) {
                            Ok(f) => f,
                            Err(_) => break,
                        };
                        for payload in frames {
                            saw_complete_request = true;
                            let req = QueuedRequest {
                                connection_uid: uid,
                                payload,
                                arrival: tokio::time::Instant::now().into_std(),
                            };
                            if adapter.enqueue(req).is_err() {
                                let _ = adapter.connections.send(
                                    uid,
                                    crate::server::protocol::frame(b"ERROR: queue overload"),
                                    adapter.config.back_packet_buffer_limit,
                                );
                            }
                        }
                    }
                }
            }
            () = tokio::time::sleep_until(empty_con_deadline), if empty_conn.enabled && !saw_complete_request => {
                break;
            }
        }
    }
    adapter.connections.remove(uid);
}

async fn run_udp(adapter: Arc<AdapterRuntime>, cancel: CancellationToken) {
    let addr = adapter.config.endpoint.socket_addr();
    let socket = match UdpSocket::bind(&addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(adapter = %adapter.config.name, %addr, error = %e, "bind failed");
            return;
        },
    };
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 65_507];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            recvd = socket.recv_from(&mut buf) => {
                let Ok((n, peer)) = recvd else { continue };
                if !is_allowed(&adapter.config, &peer.ip()) {
                    continue;
                }
                let (conn, mut outbound_rx) =
                    Connection::new(peer.ip(), peer.port(), adapter.config.endpoint.timeout);
                let uid = adapter.connections.insert(conn);
                let req = QueuedRequest {
                    connection_uid: uid,
                    payload: bytes::Bytes::copy_from_slice(&buf[..n]),
                    arrival: tokio::time::Instant::now().into_std(),
                };
                if adapter.enqueue(req).is_err() {
                    adapter.connections.remove(uid);
                    continue;
                }
                let socket = Arc::clone(&socket);
                let adapter = Arc::clone(&adapter);
                tokio::spawn(async move {
                    if let Some(reply) =
                        tokio::time::timeout(adapter.config.queue_timeout, outbound_rx.recv())
                            .await
                            .ok()
                            .flatten()
                    {
                        let _ = socket.send_to(&reply, peer).await;
                    }
                    adapter.connections.remove(uid);
                });
            }
        }
    }
}
