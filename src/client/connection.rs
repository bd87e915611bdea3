// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One outbound TCP connection to a servant endpoint.
//!
//! Grounded on the teacher's [`ClientConnection`]: split reader/writer
//! halves, a dedicated read-loop task, and response correlation by request
//! id rather than the teacher's iSCSI Initiator Task Tag. The wire envelope
//! is the same [`crate::server::protocol::LengthPrefixed`] framing the
//! server side uses, with the first four body bytes carrying the
//! big-endian request id so a single connection can multiplex many
//! in-flight calls (§4.8, "per-network-thread object proxy ... tracks
//! outstanding async calls").

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::server::protocol::{LengthPrefixed, ProtocolParser, frame};

const ID_LEN: usize = 4;

fn envelope(request_id: u32, payload: &Bytes) -> Bytes {
    let mut body = BytesMut::with_capacity(ID_LEN + payload.len());
    body.extend_from_slice(&request_id.to_be_bytes());
    body.extend_from_slice(payload);
    frame(&body)
}

fn split_envelope(mut body: Bytes) -> Result<(u32, Bytes)> {
    if body.len() < ID_LEN {
        return Err(anyhow!("response body shorter than request-id envelope"));
    }
    let id = u32::from_be_bytes(body[..ID_LEN].try_into().expect("checked len"));
    body.advance(ID_LEN);
    Ok((id, body))
}

/// One TCP connection to a single servant endpoint, shared by every
/// [`crate::client::object_proxy::ObjectProxy`] call routed to it.
pub struct ClientConnection {
    addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Connects to `addr` and spawns its read loop, which pushes every
    /// `(request_id, response payload)` pair it frames onto `completions`
    /// for the owning network thread to resolve against its pending-request
    /// registry (§4.8.4).
    pub async fn connect(
        addr: SocketAddr,
        completions: mpsc::UnboundedSender<(u32, Bytes)>,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        stream.set_nodelay(true).context("set_nodelay")?;
        let (r, w) = stream.into_split();
        let cancel = CancellationToken::new();

        let conn = Arc::new(Self { addr, writer: Mutex::new(w), cancel: cancel.clone() });
        tokio::spawn(read_loop(addr, r, completions, cancel));
        Ok(conn)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Frames and writes one request. Callers are expected to have already
    /// registered `request_id` in the owning proxy's pending-request
    /// registry before calling this, so a response racing the write still
    /// finds a waiter.
    pub async fn send(&self, request_id: u32, payload: &Bytes, io_timeout: Duration) -> Result<()> {
        let framed = envelope(request_id, payload);
        let mut writer = self.writer.lock().await;
        timeout(io_timeout, writer.write_all(&framed))
            .await
            .map_err(|_| anyhow!("write timed out to {}", self.addr))?
            .with_context(|| format!("write to {}", self.addr))
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    addr: SocketAddr,
    mut reader: OwnedReadHalf,
    completions: mpsc::UnboundedSender<(u32, Bytes)>,
    cancel: CancellationToken,
) {
    let parser = LengthPrefixed::new(0);
    let mut scratch = BytesMut::with_capacity(4096);
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            n = reader.read(&mut buf) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        scratch.extend_from_slice(&buf[..n]);
                        let frames = match parser.parse_all(&mut scratch) {
                            Ok(f) => f,
                            Err(e) => {
                                warn!(%addr, error = %e, "malformed response frame, closing connection");
                                break;
                            },
                        };
                        for body in frames {
                            match split_envelope(body) {
                                Ok((id, payload)) => {
                                    if completions.send((id, payload)).is_err() {
                                        return;
                                    }
                                },
                                Err(e) => warn!(%addr, error = %e, "dropping malformed response"),
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_request_id_and_payload() {
        let framed = envelope(42, &Bytes::from_static(b"hello"));
        let mut buf = BytesMut::from(&framed[..]);
        let body = LengthPrefixed::new(0).parse_one(&mut buf).unwrap().unwrap();
        let (id, payload) = split_envelope(body).unwrap();
        assert_eq!(id, 42);
        assert_eq!(payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn split_envelope_rejects_short_body() {
        assert!(split_envelope(Bytes::from_static(b"ab")).is_err());
    }

    #[tokio::test]
    async fn send_then_read_loop_reports_completion() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _peer) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ClientConnection::connect(addr, tx).await.unwrap();
        conn.send(7, &Bytes::from_static(b"ping"), Duration::from_secs(1)).await.unwrap();

        let (id, payload) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, 7);
        assert_eq!(payload, Bytes::from_static(b"ping"));
        server.await.unwrap();
    }
}
