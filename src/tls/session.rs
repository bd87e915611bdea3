// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection TLS session state machine (§4.5).
//!
//! Each connection owns one [`TlsSession`], which wraps an OpenSSL `Ssl`
//! handle driven over a pair of in-memory buffers rather than a live
//! socket: the net thread feeds raw bytes it read off the wire into the
//! session and drains whatever ciphertext the session wants written back,
//! which keeps all socket I/O in the net thread's own non-blocking loop
//! (§4.7.2) instead of inside OpenSSL.
//!
//! `Channel` is the `Read + Write` adapter OpenSSL drives: reads pull from
//! an input queue the caller fills via `doHandshake`/`read`, and return
//! `WouldBlock` when that queue is empty so OpenSSL reports
//! `SSL_ERROR_WANT_READ` exactly as it would for a real non-blocking
//! socket; writes append to an output buffer the caller drains.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::Arc,
};

use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslStream,
};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS setup failed: {0}")]
    Setup(#[source] openssl::error::ErrorStack),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("TLS record error: {0}")]
    Record(String),
    #[error("session is in the error state and must be closed")]
    SessionErrored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Handshaking,
    Established,
    Error,
}

#[derive(Default)]
struct ChannelInner {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

/// `Read + Write` adapter over two in-process buffers; shared (via `Arc`)
/// between the `SslStream` that owns it by value and the [`TlsSession`]
/// that feeds/drains it from outside.
#[derive(Clone, Default)]
struct Channel(Arc<Mutex<ChannelInner>>);

impl Channel {
    fn feed(&self, bytes: &[u8]) {
        self.0.lock().input.extend(bytes.iter().copied());
    }

    fn drain_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().output)
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.0.lock();
        if inner.input.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no input queued"));
        }
        let n = inner.input.len().min(buf.len());
        for slot in &mut buf[..n] {
            *slot = inner.input.pop_front().expect("checked non-empty");
        }
        Ok(n)
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Stream {
    /// Handshake has not started yet.
    Fresh,
    Handshaking(MidHandshakeSslStream<Channel>),
    Established(SslStream<Channel>),
    /// Poisoned after an unrecoverable error; the connection must close.
    Errored,
}

/// Per-connection TLS state machine: `FRESH -> HANDSHAKING -> ESTABLISHED`
/// (or `ERROR`).
pub struct TlsSession {
    role: Role,
    ctx: Arc<SslContext>,
    channel: Channel,
    stream: Stream,
    state: SessionState,
}

impl TlsSession {
    pub fn new(ctx: Arc<SslContext>, role: Role) -> Self {
        Self {
            role,
            ctx,
            channel: Channel::default(),
            stream: Stream::Fresh,
            state: SessionState::Fresh,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Feeds `bytes` (raw wire data) into the handshake and returns any
    /// outgoing TLS records produced in response. Advances `FRESH` ->
    /// `HANDSHAKING` -> `ESTABLISHED` as OpenSSL reports progress;
    /// `SSL_ERROR_WANT_READ` simply means "keep feeding me" and is not an
    /// error.
    pub fn do_handshake(&mut self, bytes: &[u8]) -> Result<Vec<u8>, TlsError> {
        if self.state == SessionState::Error {
            return Err(TlsError::SessionErrored);
        }
        self.channel.feed(bytes);

        let stream = std::mem::replace(&mut self.stream, Stream::Errored);
        let outcome = match stream {
            Stream::Fresh => {
                let ssl = Ssl::new(&self.ctx).map_err(TlsError::Setup)?;
                match self.role {
                    Role::Server => ssl.accept(self.channel.clone()),
                    Role::Client => ssl.connect(self.channel.clone()),
                }
            },
            Stream::Handshaking(mid) => mid.handshake(),
            established @ Stream::Established(_) => {
                // Handshake already complete; nothing to drive further, but
                // keep the caller's supplied bytes available for the next
                // `read()`.
                self.stream = established;
                self.state = SessionState::Established;
                return Ok(self.channel.drain_output());
            },
            Stream::Errored => return Err(TlsError::SessionErrored),
        };

        match outcome {
            Ok(established) => {
                self.stream = Stream::Established(established);
                self.state = SessionState::Established;
            },
            Err(HandshakeError::WouldBlock(mid)) => {
                self.stream = Stream::Handshaking(mid);
                self.state = SessionState::Handshaking;
            },
            Err(HandshakeError::Failure(mid)) => {
                self.state = SessionState::Error;
                let msg = mid.error().to_string();
                return Err(TlsError::Handshake(msg));
            },
            Err(HandshakeError::SetupFailure(e)) => {
                self.state = SessionState::Error;
                return Err(TlsError::Setup(e));
            },
        }

        Ok(self.channel.drain_output())
    }

    /// Encrypts `bytes` for the wire. If the handshake is not yet complete,
    /// returns `bytes` verbatim (the caller is expected to still be
    /// exchanging handshake records via `do_handshake`).
    pub fn write(&mut self, bytes: &[u8]) -> Result<Vec<u8>, TlsError> {
        if self.state != SessionState::Established {
            return Ok(bytes.to_vec());
        }
        let Stream::Established(stream) = &mut self.stream else {
            return Err(TlsError::SessionErrored);
        };
        match stream.ssl_write(bytes) {
            Ok(_) => Ok(self.channel.drain_output()),
            Err(e) => self.classify_record_error(e),
        }
    }

    /// Feeds `bytes` (raw wire data) into the session. While the handshake
    /// is still in progress this behaves like `do_handshake`, returning any
    /// outgoing records produced; once established, decrypted application
    /// data is accumulated internally and appended to `out`.
    pub fn read(&mut self, bytes: &[u8], out: &mut Vec<u8>) -> Result<Vec<u8>, TlsError> {
        if self.state != SessionState::Established {
            return self.do_handshake(bytes);
        }
        self.channel.feed(bytes);
        let Stream::Established(stream) = &mut self.stream else {
            return Err(TlsError::SessionErrored);
        };

        let mut chunk = [0u8; 4096];
        loop {
            match stream.ssl_read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.code() == ErrorCode::WANT_READ => break,
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => break,
                Err(e) => {
                    self.state = SessionState::Error;
                    return Err(TlsError::Record(e.to_string()));
                },
            }
        }
        Ok(self.channel.drain_output())
    }

    fn classify_record_error(&mut self, e: openssl::ssl::Error) -> Result<Vec<u8>, TlsError> {
        match e.code() {
            ErrorCode::WANT_READ | ErrorCode::ZERO_RETURN => Ok(self.channel.drain_output()),
            _ => {
                self.state = SessionState::Error;
                Err(TlsError::Record(e.to_string()))
            },
        }
    }
}
