// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection state and the adapter-owned connection table (§3
//! `Connection`, §4.7.2).
//!
//! Connections are created on accept, removed when closed, idle past their
//! timeout, or flagged by the empty-connection-attack check (§4.7.2). Each
//! connection has exactly one owner (its net thread); other components
//! refer to it by `uid` rather than holding a shared handle, per the
//! "single owner, back-reference by id" guidance for entities that don't
//! need shared ownership.

use std::{
    net::IpAddr,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::tls::session::TlsSession;

static NEXT_UID: AtomicU32 = AtomicU32::new(1);

/// Allocates the next monotonic connection uid, skipping zero so it can be
/// used as a "no connection" sentinel the way request ids are in
/// [`crate::collections::timeout_registry::TimeoutRegistry`].
pub fn next_uid() -> u32 {
    loop {
        let id = NEXT_UID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// A single accepted socket, owned by exactly one net thread.
pub struct Connection {
    pub uid: u32,
    pub ip: IpAddr,
    pub port: u16,
    pub last_activity: Instant,
    pub timeout: Duration,
    /// Per-connection receive scratch the net thread accumulates wire bytes
    /// into before handing whole frames to the adapter's protocol parser.
    pub recv_buffer: BytesMut,
    /// Bytes queued to write back but not yet flushed, gated by the
    /// adapter's `back_packet_buffer_limit` (§4.7.4).
    pub outbound_bytes: usize,
    pub tls: Option<TlsSession>,
    /// Handle threads push framed replies here; the owning net thread holds
    /// the matching receiver and is the only writer to the socket (§4.7.2).
    pub outbound_tx: mpsc::UnboundedSender<bytes::Bytes>,
}

impl Connection {
    pub fn new(
        ip: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<bytes::Bytes>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                uid: next_uid(),
                ip,
                port,
                last_activity: Instant::now(),
                timeout,
                recv_buffer: BytesMut::new(),
                outbound_bytes: 0,
                tls: None,
                outbound_tx,
            },
            outbound_rx,
        )
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout
    }
}

/// The set of live connections owned by one adapter (or shared across the
/// net threads servicing it). Keyed by `uid` for O(1) lookup on the hot
/// read/write path.
#[derive(Default)]
pub struct ConnectionTable {
    conns: DashMap<u32, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Connection) -> u32 {
        let uid = conn.uid;
        self.conns.insert(uid, conn);
        uid
    }

    pub fn remove(&self, uid: u32) -> Option<Connection> {
        self.conns.remove(&uid).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn touch(&self, uid: u32) {
        if let Some(mut c) = self.conns.get_mut(&uid) {
            c.touch();
        }
    }

    /// Returns the uids of connections idle past their configured timeout,
    /// used by the net thread's periodic sweep (§5).
    pub fn sweep_idle(&self) -> Vec<u32> {
        let now = Instant::now();
        self.conns
            .iter()
            .filter(|e| e.value().is_idle(now))
            .map(|e| *e.key())
            .collect()
    }

    /// Queues `payload` for the net thread owning `uid` to write back.
    /// Returns `Err(())` if the connection is gone (closed concurrently) or
    /// `back_packet_buffer_limit` (nonzero) would be exceeded — the caller
    /// is expected to close the sender in the latter case (§4.7.4).
    pub fn send(&self, uid: u32, payload: bytes::Bytes, back_pressure_limit: usize) -> Result<(), ()> {
        let mut entry = self.conns.get_mut(&uid).ok_or(())?;
        if back_pressure_limit != 0 && entry.outbound_bytes + payload.len() > back_pressure_limit {
            return Err(());
        }
        entry.outbound_bytes += payload.len();
        entry.outbound_tx.send(payload).map_err(|_| ())
    }

    /// Records that the owning net thread actually wrote `len` bytes to the
    /// socket, so `outbound_bytes` tracks queued-but-unwritten bytes instead
    /// of the cumulative lifetime total (§4.7.4).
    pub fn ack_flushed(&self, uid: u32, len: usize) {
        if let Some(mut entry) = self.conns.get_mut(&uid) {
            entry.outbound_bytes = entry.outbound_bytes.saturating_sub(len);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn uids_are_unique_and_nonzero() {
        let a = next_uid();
        let b = next_uid();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }

    #[test]
    fn table_insert_remove_round_trips() {
        let table = ConnectionTable::new();
        let (conn, _rx) = Connection::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 18001, Duration::from_secs(3));
        let uid = table.insert(conn);
        assert_eq!(table.len(), 1);
        assert!(table.remove(uid).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn ack_flushed_decrements_buffered_outbound_bytes() {
        let table = ConnectionTable::new();
        let (conn, _rx) = Connection::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 18001, Duration::from_secs(3));
        let uid = table.insert(conn);

        table.send(uid, bytes::Bytes::from_static(b"hello"), 0).unwrap();
        assert_eq!(table.conns.get(&uid).unwrap().outbound_bytes, 5);

        table.ack_flushed(uid, 5);
        assert_eq!(table.conns.get(&uid).unwrap().outbound_bytes, 0);

        // A long-lived connection that keeps sending and flushing never
        // accumulates a cumulative total that would wrongly trip the limit.
        for _ in 0..10 {
            table.send(uid, bytes::Bytes::from_static(b"world"), 8).unwrap();
            table.ack_flushed(uid, 5);
        }
        assert_eq!(table.conns.get(&uid).unwrap().outbound_bytes, 0);
    }

    #[test]
    fn sweep_idle_finds_only_expired_connections() {
        let table = ConnectionTable::new();
        let (mut stale, _rx1) =
            Connection::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1, Duration::from_millis(10));
        stale.last_activity = Instant::now() - Duration::from_secs(1);
        let stale_uid = table.insert(stale);
        let (fresh, _rx2) = Connection::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2, Duration::from_secs(60));
        let fresh_uid = table.insert(fresh);

        let idle = table.sweep_idle();
        assert_eq!(idle, vec![stale_uid]);
        assert!(!idle.contains(&fresh_uid));
    }
}
