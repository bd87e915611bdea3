// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-side half of the ak/sk handshake (§3 `BindAdapter.auth_wrapper`,
//! §4.8.5). The matching client-side challenge computation lives in
//! [`crate::client::auth`]; an adapter configured with `accesskey`/
//! `secretkey` (§6) runs this check before accepting application traffic on
//! a connection.

pub use crate::client::auth::compute_challenge;

/// Verifies a client-presented challenge against the adapter's configured
/// `ak`/`sk` and the nonce the server issued.
pub fn verify_challenge(ak: &str, sk: &str, nonce: &[u8], presented: &[u8; 16]) -> bool {
    compute_challenge(ak, sk, nonce) == *presented
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_challenge_and_rejects_wrong_secret() {
        let nonce = b"abc123";
        let challenge = compute_challenge("ak", "sk", nonce);
        assert!(verify_challenge("ak", "sk", nonce, &challenge));
        assert!(!verify_challenge("ak", "different", nonce, &challenge));
    }
}
