// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! User-supplied request handlers (GLOSSARY "Servant").
//!
//! Generated stub code for user services is out of scope (§1); what this
//! crate owns is the boundary a handle thread dispatches into. A servant is
//! an `async`-callable boxed closure rather than a trait object requiring
//! `async-trait`, matching how the rest of the crate favors free functions
//! and closures over deep trait hierarchies (§9 "deep inheritance ... base
//! and auto-pointer" is explicitly called out as something to flatten).

use std::{future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServantError {
    #[error("handler raised an exception: {0}")]
    HandlerPanicked(String),
    #[error("servant returned application error: {0}")]
    Application(String),
}

pub type ServantFuture = Pin<Box<dyn Future<Output = Result<Bytes, ServantError>> + Send>>;

/// A servant handler bound to one adapter. Takes the request payload
/// (already de-framed by the adapter's [`crate::server::protocol::ProtocolParser`])
/// and the connection uid it arrived on, returns the reply payload.
pub type Servant = Arc<dyn Fn(u32, Bytes) -> ServantFuture + Send + Sync>;

/// Wraps an ordinary async function as a [`Servant`].
pub fn servant_fn<F, Fut>(f: F) -> Servant
where
    F: Fn(u32, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, ServantError>> + Send + 'static,
{
    Arc::new(move |uid, req| Box::pin(f(uid, req)))
}

/// A servant that always echoes the request back, used by tests and as the
/// built-in admin servant's fallback for unknown commands.
pub fn echo_servant() -> Servant {
    servant_fn(|_uid, req| async move { Ok(req) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_servant_returns_request_verbatim() {
        let servant = echo_servant();
        let reply = servant(1, Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
    }
}
