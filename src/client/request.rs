// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The client-side pending-call type (§3 `RequestMessage`).
//!
//! Owned by the network thread that sent it until a response arrives or the
//! owning [`crate::client::object_proxy::ObjectProxy`]'s
//! [`crate::collections::timeout_registry::TimeoutRegistry`] sweeps it on
//! timeout (§4.8.4); ownership then transfers to whichever async-response
//! worker the caller's callback is assigned to.

use std::time::Instant;

use bitflags::bitflags;
use bytes::Bytes;
use tokio::sync::oneshot;

bitflags! {
    /// Per-request flags threaded alongside the payload. Dyeing (GLOSSARY)
    /// is the only one spec.md names explicitly; `FORCE_SYNC` models a
    /// caller that wants `invoke()` to block even though a callback was
    /// supplied, which the source's request-message header also carries as
    /// a bit rather than a second call path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u8 {
        const DYEING = 0b0000_0001;
        const FORCE_SYNC = 0b0000_0010;
    }
}

/// Outcome delivered to a caller or callback once a request is resolved
/// (§4.8.4, §7 kind 7).
#[derive(Debug, Clone)]
pub enum InvokeResult {
    Response(Bytes),
    Timeout,
    ConnectRefused,
    NoEndpoint,
    AuthFailure,
}

/// A single outstanding asynchronous call (§3 `RequestMessage`).
pub struct RequestMessage {
    pub request_id: u32,
    pub servant_name: String,
    pub method: String,
    pub payload: Bytes,
    pub sent_time: Instant,
    pub flags: RequestFlags,
    pub dyeing_key: Option<String>,
    /// Endpoint the request was actually routed to, filled in once sent;
    /// used by error reporting and by `tars.connection`-style admin dumps.
    pub adapter_endpoint: Option<String>,
    /// Fulfilled exactly once: by the reader loop on response, or by the
    /// timeout sweep. A synchronous `invoke()` awaits this directly; an
    /// asynchronous one hands the receiving half to an async-response
    /// worker (§4.8.4) that awaits it and then runs the user callback.
    pub completion: oneshot::Sender<InvokeResult>,
}

impl RequestMessage {
    pub fn new(
        request_id: u32,
        servant_name: impl Into<String>,
        method: impl Into<String>,
        payload: Bytes,
        flags: RequestFlags,
        dyeing_key: Option<String>,
    ) -> (Self, oneshot::Receiver<InvokeResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request_id,
                servant_name: servant_name.into(),
                method: method.into(),
                payload,
                sent_time: Instant::now(),
                flags,
                dyeing_key,
                adapter_endpoint: None,
                completion: tx,
            },
            rx,
        )
    }

    pub fn is_dyeing(&self) -> bool {
        self.flags.contains(RequestFlags::DYEING)
    }
}

impl std::fmt::Debug for RequestMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMessage")
            .field("request_id", &self.request_id)
            .field("servant_name", &self.servant_name)
            .field("method", &self.method)
            .field("flags", &self.flags)
            .field("dyeing_key", &self.dyeing_key)
            .field("adapter_endpoint", &self.adapter_endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dyeing_flag_is_observable() {
        let (msg, _rx) = RequestMessage::new(
            1,
            "Demo.S.Obj",
            "echo",
            Bytes::from_static(b"x"),
            RequestFlags::DYEING,
            Some("trace-1".to_string()),
        );
        assert!(msg.is_dyeing());
        assert_eq!(msg.dyeing_key.as_deref(), Some("trace-1"));
    }

    #[test]
    fn plain_request_is_not_dyeing() {
        let (msg, _rx) = RequestMessage::new(
            2,
            "Demo.S.Obj",
            "echo",
            Bytes::new(),
            RequestFlags::empty(),
            None,
        );
        assert!(!msg.is_dyeing());
    }
}
