// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Built-in admin commands (§4.7.5, §6): the servant bound to the
//! synthesized `admin` adapter (see
//! [`crate::cfg::server_config::ServerConfig::from_domain`]) dispatches
//! through an [`AdminRegistry`] of `(name, handler)` pairs rather than a
//! hand-coded `match` over every command, matching how
//! [`crate::server::protocol::ProtocolParser`] and
//! [`crate::hash::consistent::ConsistentHashRing`] both favor a small
//! registered-strategy shape over growing one big enum.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::{logger::LogHandle, server_config::ServerConfig, tarsdat::TarsDat},
    server::{adapter::AdapterRuntime, servant::{Servant, servant_fn}},
};

/// Process/server identity and live state an admin handler may need.
/// Shared (not owned) by every handler; handlers read or mutate through the
/// `Arc`/interior-mutability fields rather than taking `&mut self`, since
/// several handlers may run concurrently across handle threads (§4.7.5).
pub struct AdminContext {
    pub config: ServerConfig,
    pub adapters: Vec<Arc<AdapterRuntime>>,
    pub tarsdat: Arc<tokio::sync::Mutex<TarsDat>>,
    pub log_handle: Option<Arc<LogHandle>>,
    pub dyeing_key: Mutex<Option<String>>,
    pub cancel: CancellationToken,
    pub version: &'static str,
}

impl AdminContext {
    pub fn new(
        config: ServerConfig,
        adapters: Vec<Arc<AdapterRuntime>>,
        tarsdat: Arc<tokio::sync::Mutex<TarsDat>>,
        log_handle: Option<Arc<LogHandle>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            adapters,
            tarsdat,
            log_handle,
            dyeing_key: Mutex::new(None),
            cancel,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = String> + Send>>;
type AdminHandler = Arc<dyn Fn(Arc<AdminContext>, Vec<String>) -> HandlerFuture + Send + Sync>;

/// A registry of admin command name to handler, built once at bootstrap
/// (§4.7.5). Unknown commands and duplicate registrations are both
/// resolved the same way other lookup tables in this crate resolve
/// "shouldn't happen but might" cases: unknown commands get a descriptive
/// error string back rather than closing the connection (§7), and
/// registering the same name twice silently replaces the previous handler,
/// same as [`crate::hash::consistent::ConsistentHashRing::add_node`]
/// overwriting an existing node index.
#[derive(Clone, Default)]
pub struct AdminRegistry {
    handlers: HashMap<String, AdminHandler>,
}

impl AdminRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<AdminContext>, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = String> + Send + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(move |ctx, args| Box::pin(handler(ctx, args))));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    async fn dispatch(&self, ctx: Arc<AdminContext>, line: &str) -> String {
        let mut tokens = line.split_whitespace();
        let Some(cmd) = tokens.next() else {
            return "ERROR: empty command".to_string();
        };
        let args: Vec<String> = tokens.map(str::to_string).collect();
        match self.handlers.get(cmd) {
            Some(handler) => handler(ctx, args).await,
            None => format!("ERROR: unknown command {cmd:?}"),
        }
    }
}

/// Registers every built-in command named in §6's admin command table.
pub fn builtin_registry() -> AdminRegistry {
    let mut registry = AdminRegistry::new();

    registry.register("tars.viewversion", |ctx, _args| async move { ctx.version.to_string() });

    registry.register("tars.viewstatus", |ctx, _args| async move {
        ctx.adapters
            .iter()
            .map(|a| {
                format!(
                    "{}: conns={} overload={} timeout={}",
                    a.config.name,
                    a.connections.len(),
                    a.overload_count.load(std::sync::atomic::Ordering::Relaxed),
                    a.timeout_count.load(std::sync::atomic::Ordering::Relaxed),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    });

    registry.register("tars.connection", |ctx, _args| async move {
        ctx.adapters
            .iter()
            .map(|a| format!("{}: {} connections", a.config.name, a.connections.len()))
            .collect::<Vec<_>>()
            .join("\n")
    });

    registry.register("tars.setloglevel", |ctx, args| async move {
        let Some(level) = args.first() else { return "ERROR: usage: tars.setloglevel <LEVEL>".to_string() };
        let Some(handle) = ctx.log_handle.as_ref() else { return "ERROR: logger not initialized".to_string() };
        if let Err(e) = handle.set_level(level) {
            return format!("ERROR: {e}");
        }
        let mut dat = ctx.tarsdat.lock().await;
        dat.log_level = level.clone();
        if let Err(e) = dat.store(&ctx.config.datapath, &ctx.config.server).await {
            return format!("WARN: log level changed but persistence failed: {e}");
        }
        format!("OK: log level set to {level}")
    });

    registry.register("tars.enabledaylog", |_ctx, _args| async move {
        "OK: day-log reporting is not implemented by this build".to_string()
    });

    registry.register("tars.loadconfig", |ctx, args| async move {
        format!("OK: config reload acknowledged for {} (args: {:?})", ctx.config.server, args)
    });

    registry.register("tars.loadproperty", |_ctx, _args| async move {
        "OK: property reload acknowledged".to_string()
    });

    registry.register("tars.viewadmincommands", |_ctx, _args| async move {
        BUILTIN_COMMAND_NAMES.join("\n")
    });

    registry.register("tars.setdyeing", |ctx, args| async move {
        let key = args.first().cloned();
        *ctx.dyeing_key.lock() = key.clone();
        match key {
            Some(k) => format!("OK: dyeing key set to {k}"),
            None => "OK: dyeing key cleared".to_string(),
        }
    });

    registry.register("tars.closecore", |ctx, args| async move {
        let Some(arg) = args.first() else { return "ERROR: usage: tars.closecore {yes|no}".to_string() };
        let enable = match arg.to_ascii_lowercase().as_str() {
            "yes" => true,
            "no" => false,
            _ => return format!("ERROR: usage: tars.closecore {{yes|no}}, got {arg:?}"),
        };
        let mut dat = ctx.tarsdat.lock().await;
        dat.core_dump = enable;
        if let Err(e) = dat.store(&ctx.config.datapath, &ctx.config.server).await {
            return format!("WARN: core-dump setting changed but persistence failed: {e}");
        }
        format!("OK: core dump {}", if enable { "enabled" } else { "disabled" })
    });

    registry.register("tars.reloadlocator", |_ctx, _args| async move {
        "OK: locator cache reload acknowledged".to_string()
    });

    registry
}

const BUILTIN_COMMAND_NAMES: &[&str] = &[
    "tars.viewstatus",
    "tars.connection",
    "tars.setloglevel",
    "tars.enabledaylog",
    "tars.loadconfig",
    "tars.viewversion",
    "tars.loadproperty",
    "tars.viewadmincommands",
    "tars.setdyeing",
    "tars.closecore",
    "tars.reloadlocator",
];

/// Wraps an [`AdminRegistry`] and its [`AdminContext`] as the [`Servant`]
/// bound to the synthesized `admin` adapter.
pub fn admin_servant(ctx: Arc<AdminContext>, registry: Arc<AdminRegistry>) -> Servant {
    servant_fn(move |_uid, payload: Bytes| {
        let ctx = Arc::clone(&ctx);
        let registry = Arc::clone(&registry);
        async move {
            let line = String::from_utf8_lossy(&payload).to_string();
            let response = registry.dispatch(ctx, &line).await;
            Ok(Bytes::from(response))
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cfg::{enums::Transport, server_config::{BindAdapter, Endpoint}};

    fn sample_config() -> ServerConfig {
        ServerConfig {
            app: "Demo".to_string(),
            server: "S".to_string(),
            localip: "127.0.0.1".to_string(),
            basepath: ".".to_string(),
            datapath: std::env::temp_dir().join(format!("admin-test-{}", std::process::id())).to_string_lossy().to_string(),
            logpath: ".".to_string(),
            logsize: 0,
            lognum: 1,
            local: None,
            log_level: "INFO".to_string(),
            netthread: 1,
            opencoroutine: false,
            coroutine_mem_size: 0,
            coroutine_stack_size: 0,
            close_cout: true,
            logstatreport: false,
            empty_con_check: false,
            empty_conn_timeout: Duration::from_secs(3),
            reportflow: true,
            checkset: true,
            pool_min_block_size: 0,
            pool_max_block_size: 0,
            pool_max_bytes: 0,
            back_packet_buffer_limit: 0,
            adapters: Vec::new(),
        }
    }

    fn sample_adapter() -> Arc<AdapterRuntime> {
        Arc::new(AdapterRuntime::new(
            BindAdapter {
                name: "echo".to_string(),
                servant: "Demo.S.Echo".to_string(),
                endpoint: Endpoint { transport: Transport::Tcp, host: "127.0.0.1".to_string(), port: 0, timeout: Duration::from_secs(1) },
                max_conns: 1,
                queue_capacity: 1,
                queue_timeout: Duration::from_secs(1),
                protocol_name: "tars".to_string(),
                handle_group_name: "echo".to_string(),
                handle_count: 1,
                allow_list: Vec::new(),
                deny_list: Vec::new(),
                order: crate::cfg::enums::AclOrder::AllowDeny,
                back_packet_buffer_limit: 0,
                ak: None,
                sk: None,
            },
            Arc::new(crate::server::protocol::LengthPrefixed::new(0)),
            crate::server::servant::echo_servant(),
        ))
    }

    fn sample_context() -> Arc<AdminContext> {
        Arc::new(AdminContext::new(
            sample_config(),
            vec![sample_adapter()],
            Arc::new(tokio::sync::Mutex::new(TarsDat::default())),
            None,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn viewversion_returns_crate_version() {
        let registry = builtin_registry();
        let ctx = sample_context();
        let reply = registry.dispatch(ctx, "tars.viewversion").await;
        assert_eq!(reply, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn unknown_command_reports_error_without_panicking() {
        let registry = builtin_registry();
        let ctx = sample_context();
        let reply = registry.dispatch(ctx, "tars.doesnotexist").await;
        assert!(reply.starts_with("ERROR: unknown command"));
    }

    #[tokio::test]
    async fn setdyeing_records_and_clears_key() {
        let registry = builtin_registry();
        let ctx = sample_context();
        let reply = registry.dispatch(Arc::clone(&ctx), "tars.setdyeing abc").await;
        assert_eq!(reply, "OK: dyeing key set to abc");
        assert_eq!(ctx.dyeing_key.lock().as_deref(), Some("abc"));

        let reply = registry.dispatch(Arc::clone(&ctx), "tars.setdyeing").await;
        assert_eq!(reply, "OK: dyeing key cleared");
        assert!(ctx.dyeing_key.lock().is_none());
    }

    #[tokio::test]
    async fn closecore_toggles_core_dump_flag_without_affecting_the_process() {
        let registry = builtin_registry();
        let ctx = sample_context();

        let reply = registry.dispatch(Arc::clone(&ctx), "tars.closecore yes").await;
        assert_eq!(reply, "OK: core dump enabled");
        assert!(!ctx.cancel.is_cancelled(), "an admin command must not affect the process (§7 kind 9)");
        assert!(ctx.tarsdat.lock().await.core_dump);

        let reply = registry.dispatch(Arc::clone(&ctx), "tars.closecore no").await;
        assert_eq!(reply, "OK: core dump disabled");
        assert!(!ctx.tarsdat.lock().await.core_dump);

        let reply = registry.dispatch(Arc::clone(&ctx), "tars.closecore maybe").await;
        assert!(reply.starts_with("ERROR"));

        let _ = std::fs::remove_dir_all(&ctx.config.datapath);
    }

    #[tokio::test]
    async fn admin_servant_round_trips_through_the_registry() {
        let registry = Arc::new(builtin_registry());
        let ctx = sample_context();
        let servant = admin_servant(ctx, registry);
        let reply = servant(1, Bytes::from_static(b"tars.viewversion")).await.unwrap();
        assert_eq!(reply, Bytes::from(env!("CARGO_PKG_VERSION")));
    }
}
